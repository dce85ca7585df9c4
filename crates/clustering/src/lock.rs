use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use kernel_core::{ClusterConfig, KernelError, KernelResult};

use crate::dispatcher::{CallOptions, GroupRpcDispatcher};
use crate::filter::{ResponseFilter, ResponseValue};
use crate::handler::RpcHandler;
use crate::node::ClusterNode;

const REMOTE_LOCK: &str = "remote_lock";
const REMOTE_RELEASE: &str = "remote_release";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// 所有成员都同意
    AcquiredFromCluster,
    /// 本节点已经持有该锁
    AlreadyHeld,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum RemoteLockResponse {
    Granted,
    Rejected { holder: ClusterNode },
}

/// 集群范围的互斥锁
///
/// 每个成员在本地记录锁的持有者；加锁时向所有成员（包括自己）请求，
/// 只有全部成员同意才算成功，否则向所有成员撤回并重试，直到超时。
/// 撤回与请求走同一个有序序列，迟到的同意也会在撤回之前处理掉。
/// 持有者离开视图后，它持有的锁自动释放。
pub struct ClusterLockManager {
    inner: Arc<LockInner>,
}

struct LockInner {
    service: String,
    dispatcher: GroupRpcDispatcher,
    retry_interval: Duration,
    holders: Mutex<HashMap<String, Holder>>,
    handler: Mutex<Option<Arc<RpcHandler>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

type LockArgs = (String, ClusterNode);

/// 锁持有者及其获得锁时的化身
#[derive(Debug, Clone)]
struct Holder {
    node: ClusterNode,
    incarnation: Option<u64>,
}

impl ClusterLockManager {
    pub async fn start(
        service: &str,
        dispatcher: GroupRpcDispatcher,
        config: &ClusterConfig,
    ) -> KernelResult<Self> {
        let inner = Arc::new(LockInner {
            service: service.to_string(),
            dispatcher,
            retry_interval: config.lock_retry_interval(),
            holders: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            watcher: Mutex::new(None),
        });

        let lock_ref = Arc::downgrade(&inner);
        let release_ref = Arc::downgrade(&inner);
        let handler = RpcHandler::builder(service)
            .method(REMOTE_LOCK, move |(name, caller): LockArgs| {
                let inner = Weak::clone(&lock_ref);
                async move {
                    let inner = inner.upgrade().ok_or("锁管理器已停止")?;
                    Ok::<_, &str>(inner.grant(&name, caller).await)
                }
            })
            .method(REMOTE_RELEASE, move |(name, caller): LockArgs| {
                let inner = Weak::clone(&release_ref);
                async move {
                    let inner = inner.upgrade().ok_or("锁管理器已停止")?;
                    inner.release_for(&name, &caller).await;
                    Ok::<_, &str>(())
                }
            })
            .build();
        inner.dispatcher.register_handler(Arc::clone(&handler)).await?;
        *inner.handler.lock().await = Some(handler);

        let mut views = inner.dispatcher.transport().subscribe_views();
        let view_ref = Arc::downgrade(&inner);
        let watcher = tokio::spawn(async move {
            while views.next().await.is_some() {
                let Some(inner) = view_ref.upgrade() else {
                    break;
                };
                // 以最新视图为准，已经重新加入的持有者也算离开过
                let view = inner.dispatcher.current_view();
                inner.holders.lock().await.retain(|name, holder| {
                    let alive = match holder.incarnation {
                        Some(incarnation) => view.has_incarnation(&holder.node, incarnation),
                        None => view.contains(&holder.node),
                    };
                    if !alive {
                        info!(lock = %name, holder = %holder.node, "锁持有者已离开，释放锁");
                    }
                    alive
                });
            }
        });
        *inner.watcher.lock().await = Some(watcher);

        Ok(Self { inner })
    }

    pub async fn stop(&self) -> KernelResult<()> {
        if let Some(watcher) = self.inner.watcher.lock().await.take() {
            watcher.abort();
        }
        if let Some(handler) = self.inner.handler.lock().await.take() {
            self.inner
                .dispatcher
                .unregister_handler(&self.inner.service, &handler)
                .await?;
        }
        Ok(())
    }

    pub fn local_node(&self) -> &ClusterNode {
        self.inner.dispatcher.local_node()
    }

    /// 当前本地记录的持有者
    pub async fn holder(&self, name: &str) -> Option<ClusterNode> {
        self.inner
            .holders
            .lock()
            .await
            .get(name)
            .map(|holder| holder.node.clone())
    }

    pub async fn lock(&self, name: &str, timeout: Duration) -> KernelResult<LockResult> {
        let local = self.local_node().clone();
        if self.holder(name).await.as_ref() == Some(&local) {
            return Ok(LockResult::AlreadyHeld);
        }

        let deadline = Instant::now() + timeout;
        let args: LockArgs = (name.to_string(), local.clone());
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let responses = self
                .inner
                .dispatcher
                .call_method_on_cluster_responses(
                    &self.inner.service,
                    REMOTE_LOCK,
                    &args,
                    CallOptions::new()
                        .with_timeout(remaining)
                        .with_filter(StopOnRejection::default()),
                )
                .await?;

            let mut granted = Vec::new();
            let mut blocked_by = None;
            for (node, response) in responses {
                match decode_lock_response(&response) {
                    Some(RemoteLockResponse::Granted) => granted.push(node),
                    Some(RemoteLockResponse::Rejected { holder }) => blocked_by = Some(holder),
                    None => blocked_by = Some(node),
                }
            }

            // 超时返回的部分结果不算获得
            if blocked_by.is_none() && granted.contains(&local) && Instant::now() < deadline {
                debug!(lock = name, members = granted.len(), "获得集群锁");
                return Ok(LockResult::AcquiredFromCluster);
            }

            // 没有响应的成员之后仍可能同意，所以撤回要发给所有成员
            if let Err(e) = self
                .inner
                .dispatcher
                .call_async_method_on_cluster(&self.inner.service, REMOTE_RELEASE, &args, CallOptions::new())
                .await
            {
                warn!(lock = name, granted = granted.len(), error = %e, "撤回锁请求失败");
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(KernelError::timeout(format!(
                    "获取集群锁 {name} 超时，当前阻塞于 {}",
                    blocked_by.map(|n| n.to_string()).unwrap_or_else(|| "未知成员".to_string())
                )));
            }
            tokio::time::sleep(self.inner.retry_interval.min(deadline - now)).await;
        }
    }

    /// 在所有成员上释放本节点持有的锁
    pub async fn unlock(&self, name: &str) -> KernelResult<()> {
        let args: LockArgs = (name.to_string(), self.local_node().clone());
        self.inner
            .dispatcher
            .call_method_on_cluster_responses(
                &self.inner.service,
                REMOTE_RELEASE,
                &args,
                CallOptions::new(),
            )
            .await?;
        Ok(())
    }

    /// 只释放本地记录
    ///
    /// 这是本节点专用的操作，`caller` 不是本节点属于调用方的编程错误。
    pub async fn release_local(&self, name: &str, caller: &ClusterNode) -> KernelResult<()> {
        if caller != self.local_node() {
            return Err(KernelError::illegal_state(format!(
                "{caller} 不是本节点 {}，不能释放本地锁 {name}",
                self.local_node()
            )));
        }
        self.inner.release_for(name, caller).await;
        Ok(())
    }
}

impl LockInner {
    async fn grant(&self, name: &str, caller: ClusterNode) -> RemoteLockResponse {
        let incarnation = self.dispatcher.current_view().incarnation(&caller);
        let mut holders = self.holders.lock().await;
        match holders.get(name) {
            Some(holder) if holder.node != caller => RemoteLockResponse::Rejected {
                holder: holder.node.clone(),
            },
            _ => {
                holders.insert(
                    name.to_string(),
                    Holder {
                        node: caller,
                        incarnation,
                    },
                );
                RemoteLockResponse::Granted
            }
        }
    }

    async fn release_for(&self, name: &str, caller: &ClusterNode) {
        let mut holders = self.holders.lock().await;
        if holders.get(name).is_some_and(|holder| &holder.node == caller) {
            holders.remove(name);
        }
    }
}

/// 保留全部响应，遇到第一个拒绝就不再等待
#[derive(Default)]
struct StopOnRejection {
    rejected: bool,
}

impl ResponseFilter for StopOnRejection {
    fn is_acceptable(&mut self, response: &ResponseValue, _sender: &ClusterNode) -> bool {
        if !matches!(decode_lock_response(response), Some(RemoteLockResponse::Granted)) {
            self.rejected = true;
        }
        true
    }

    fn need_more_responses(&self) -> bool {
        !self.rejected
    }
}

fn decode_lock_response(response: &ResponseValue) -> Option<RemoteLockResponse> {
    response
        .value()
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}
