use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use kernel_core::KernelResult;

use crate::message::GroupMessage;
use crate::node::ClusterNode;
use crate::view::GroupView;

/// 组通信传输层
///
/// 分发器只依赖这几个能力：本节点身份、当前视图及其变化、点对点发送和接收。
///
/// 点对点发送是可靠的：只要目标仍在视图中，消息最终都会送达，
/// 只有目标离开组时才会丢失。
#[async_trait]
pub trait GroupTransport: Send + Sync {
    fn local_node(&self) -> &ClusterNode;

    fn current_view(&self) -> GroupView;

    /// 订阅之后安装的每一个视图，中间视图不会被合并掉
    fn subscribe_views(&self) -> ViewSubscription;

    /// 发送给单个成员，目标不在组内时返回不可达错误
    async fn send(&self, to: &ClusterNode, message: GroupMessage) -> KernelResult<()>;

    /// 接收下一条消息，本节点离开组后返回 `None`
    async fn receive(&self) -> Option<GroupMessage>;

    fn is_coordinator(&self) -> bool {
        self.current_view().is_coordinator(self.local_node())
    }
}

/// 视图流
///
/// 按安装顺序逐个产出视图。
pub struct ViewSubscription {
    receiver: broadcast::Receiver<GroupView>,
}

impl ViewSubscription {
    pub fn new(receiver: broadcast::Receiver<GroupView>) -> Self {
        Self { receiver }
    }

    /// 下一个视图，视图源关闭后返回 `None`
    pub async fn next(&mut self) -> Option<GroupView> {
        loop {
            match self.receiver.recv().await {
                Ok(view) => return Some(view),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "视图订阅者处理过慢，跳过了部分视图");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
