use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, trace};

use kernel_core::{KernelError, KernelResult};

use crate::message::GroupMessage;
use crate::node::ClusterNode;
use crate::transport::{GroupTransport, ViewSubscription};
use crate::view::GroupView;

#[derive(Debug, Clone, Default)]
pub struct InMemoryNetworkConfig {
    /// 每条消息投递前随机延迟的上限（毫秒，0表示不延迟）
    ///
    /// 延迟会打乱同一发送方消息的到达顺序。
    pub max_delivery_jitter_ms: u64,
}

/// 进程内的组通信网络
///
/// 使用 Tokio channels 在同一进程内模拟一个通信组，适用于嵌入式部署和测试。
/// 成员按加入顺序排列，最早加入的成员是协调者。
#[derive(Clone)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    config: InMemoryNetworkConfig,
    members: RwLock<Vec<Member>>,
    /// 仍在视图中但暂时收不到消息的成员，以及为它积压的消息
    suspended: Mutex<HashMap<ClusterNode, Vec<GroupMessage>>>,
    views: watch::Sender<GroupView>,
    view_feed: broadcast::Sender<GroupView>,
}

const VIEW_FEED_CAPACITY: usize = 256;

struct Member {
    node: ClusterNode,
    sender: mpsc::UnboundedSender<GroupMessage>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::with_config(InMemoryNetworkConfig::default())
    }

    pub fn with_config(config: InMemoryNetworkConfig) -> Self {
        let (views, _) = watch::channel(GroupView::default());
        let (view_feed, _) = broadcast::channel(VIEW_FEED_CAPACITY);
        Self {
            inner: Arc::new(NetworkInner {
                config,
                members: RwLock::new(Vec::new()),
                suspended: Mutex::new(HashMap::new()),
                views,
                view_feed,
            }),
        }
    }

    /// 加入网络并安装新视图
    pub async fn join(&self, node: ClusterNode) -> KernelResult<Arc<InMemoryTransport>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut members = self.inner.members.write().await;
        if members.iter().any(|m| m.node == node) {
            return Err(KernelError::illegal_state(format!("节点 {node} 已经在组内")));
        }
        members.push(Member {
            node: node.clone(),
            sender,
        });
        let view = self.inner.install_view(&members);
        info!(node = %node, view_id = view.view_id(), members = view.len(), "节点加入通信组");

        Ok(Arc::new(InMemoryTransport {
            local: node,
            network: Arc::clone(&self.inner),
            inbox: Mutex::new(receiver),
        }))
    }

    /// 离开网络，返回该节点之前是否在组内
    pub async fn leave(&self, node: &ClusterNode) -> bool {
        let mut members = self.inner.members.write().await;
        let before = members.len();
        members.retain(|m| &m.node != node);
        if members.len() == before {
            return false;
        }
        if let Some(backlog) = self.inner.suspended.lock().await.remove(node) {
            debug!(node = %node, dropped = backlog.len(), "挂起节点离开，积压消息作废");
        }
        let view = self.inner.install_view(&members);
        info!(node = %node, view_id = view.view_id(), members = view.len(), "节点离开通信组");
        true
    }

    /// 让节点保持在视图中，但暂停向它投递消息
    ///
    /// 发给它的消息会积压起来，恢复后按发送顺序补发。
    pub async fn suspend(&self, node: &ClusterNode) {
        self.inner
            .suspended
            .lock()
            .await
            .entry(node.clone())
            .or_default();
    }

    pub async fn resume(&self, node: &ClusterNode) {
        // 与 leave 相同的加锁顺序：先成员表，后挂起表
        let sender = self
            .inner
            .members
            .read()
            .await
            .iter()
            .find(|m| &m.node == node)
            .map(|m| m.sender.clone());
        let mut suspended = self.inner.suspended.lock().await;
        let Some(backlog) = suspended.remove(node) else {
            return;
        };
        let Some(sender) = sender else {
            return;
        };
        debug!(node = %node, backlog = backlog.len(), "节点恢复，补发积压消息");
        for message in backlog {
            if sender.send(message).is_err() {
                break;
            }
        }
    }

    pub fn view(&self) -> GroupView {
        self.inner.views.borrow().clone()
    }
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkInner {
    fn install_view(&self, members: &[Member]) -> GroupView {
        let nodes = members.iter().map(|m| m.node.clone()).collect();
        let view = self.views.borrow().successor(nodes);
        self.views.send_replace(view.clone());
        // 没有订阅者时发送失败，可以忽略
        let _ = self.view_feed.send(view.clone());
        view
    }
}

/// 某个成员在进程内网络上的传输端点
pub struct InMemoryTransport {
    local: ClusterNode,
    network: Arc<NetworkInner>,
    inbox: Mutex<mpsc::UnboundedReceiver<GroupMessage>>,
}

#[async_trait]
impl GroupTransport for InMemoryTransport {
    fn local_node(&self) -> &ClusterNode {
        &self.local
    }

    fn current_view(&self) -> GroupView {
        self.network.views.borrow().clone()
    }

    fn subscribe_views(&self) -> ViewSubscription {
        ViewSubscription::new(self.network.view_feed.subscribe())
    }

    async fn send(&self, to: &ClusterNode, message: GroupMessage) -> KernelResult<()> {
        let sender = self
            .network
            .members
            .read()
            .await
            .iter()
            .find(|m| &m.node == to)
            .map(|m| m.sender.clone())
            .ok_or_else(|| KernelError::unreachable(to.to_string()))?;

        {
            let mut suspended = self.network.suspended.lock().await;
            if let Some(backlog) = suspended.get_mut(to) {
                trace!(to = %to, "目标节点已挂起，消息暂存");
                backlog.push(message);
                return Ok(());
            }
        }

        let max_jitter = self.network.config.max_delivery_jitter_ms;
        if max_jitter == 0 {
            return sender
                .send(message)
                .map_err(|_| KernelError::unreachable(to.to_string()));
        }

        let delay = rand::rng().random_range(0..=max_jitter);
        let to = to.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if sender.send(message).is_err() {
                debug!(to = %to, "延迟投递时目标节点已离开");
            }
        });
        Ok(())
    }

    async fn receive(&self) -> Option<GroupMessage> {
        self.inbox.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> ClusterNode {
        ClusterNode::new(name, "127.0.0.1", 7600)
    }

    #[tokio::test]
    async fn test_views_follow_join_order() {
        let network = InMemoryNetwork::new();
        let a = network.join(node("a")).await.unwrap();
        let _b = network.join(node("b")).await.unwrap();

        let view = a.current_view();
        assert_eq!(view.view_id(), 2);
        assert!(a.is_coordinator());
        assert_eq!(view.members(), &[node("a"), node("b")]);

        assert!(network.join(node("a")).await.is_err());
        assert!(network.leave(&node("a")).await);
        assert!(!network.leave(&node("a")).await);
        assert_eq!(network.view().coordinator(), Some(&node("b")));
        assert_eq!(network.view().view_id(), 3);
    }

    #[tokio::test]
    async fn test_send_to_non_member_is_unreachable() {
        let network = InMemoryNetwork::new();
        let a = network.join(node("a")).await.unwrap();
        let ping = GroupMessage::Response(crate::message::RpcResponse {
            request_id: 1,
            sender: node("a"),
            outcome: crate::message::ResponseOutcome::NoHandler,
        });

        let err = a.send(&node("ghost"), ping.clone()).await.unwrap_err();
        assert!(matches!(err, KernelError::DispatchUnreachable(_)));

        a.send(&node("a"), ping.clone()).await.unwrap();
        assert_eq!(a.receive().await, Some(ping));
    }

    #[tokio::test]
    async fn test_every_view_is_published_in_order() {
        let network = InMemoryNetwork::new();
        let a = network.join(node("a")).await.unwrap();
        let mut views = a.subscribe_views();

        let _b = network.join(node("b")).await.unwrap();
        network.leave(&node("b")).await;
        let _b = network.join(node("b")).await.unwrap();

        let ids: Vec<u64> = [
            views.next().await.unwrap(),
            views.next().await.unwrap(),
            views.next().await.unwrap(),
        ]
        .iter()
        .map(GroupView::view_id)
        .collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(network.view().incarnation(&node("b")), Some(4));
    }

    #[tokio::test]
    async fn test_suspended_member_receives_backlog_after_resume() {
        let network = InMemoryNetwork::new();
        let a = network.join(node("a")).await.unwrap();
        let b = network.join(node("b")).await.unwrap();
        let message = |request_id| {
            GroupMessage::Response(crate::message::RpcResponse {
                request_id,
                sender: node("a"),
                outcome: crate::message::ResponseOutcome::NoHandler,
            })
        };

        network.suspend(&node("b")).await;
        a.send(&node("b"), message(1)).await.unwrap();
        a.send(&node("b"), message(2)).await.unwrap();
        let idle = tokio::time::timeout(Duration::from_millis(50), b.receive()).await;
        assert!(idle.is_err());

        network.resume(&node("b")).await;
        assert_eq!(b.receive().await, Some(message(1)));
        assert_eq!(b.receive().await, Some(message(2)));
    }
}
