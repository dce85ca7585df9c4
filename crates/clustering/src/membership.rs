use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use kernel_core::{ClusterConfig, KernelResult};

use crate::node::ClusterNode;
use crate::transport::GroupTransport;
use crate::view::{GroupView, MembershipChange};

/// 组成员变化监听器
#[async_trait]
pub trait GroupMembershipListener: Send + Sync {
    async fn membership_changed(&self, change: &MembershipChange);
}

type Listener = Arc<dyn GroupMembershipListener>;

/// 视图历史中的一条记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub view_id: u64,
    /// 服务启动时看到的视图，没有离开和加入信息
    pub initial: bool,
    pub members: Vec<ClusterNode>,
    pub dead_members: Vec<ClusterNode>,
    pub new_members: Vec<ClusterNode>,
}

impl ViewHistoryEntry {
    fn initial(view: &GroupView) -> Self {
        Self {
            timestamp: Utc::now(),
            view_id: view.view_id(),
            initial: true,
            members: view.members().to_vec(),
            dead_members: Vec::new(),
            new_members: Vec::new(),
        }
    }

    fn change(change: &MembershipChange) -> Self {
        Self {
            timestamp: Utc::now(),
            view_id: change.view_id,
            initial: false,
            members: change.all_members.clone(),
            dead_members: change.dead_members.clone(),
            new_members: change.new_members.clone(),
        }
    }
}

impl fmt::Display for ViewHistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let timestamp = self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
        if self.initial {
            return write!(
                f,
                "{timestamp} 初始视图 {} 成员 {}",
                self.view_id,
                format_nodes(&self.members)
            );
        }
        write!(
            f,
            "{timestamp} 视图 {} 成员 {} 离开 {} 加入 {}",
            self.view_id,
            format_nodes(&self.members),
            format_nodes(&self.dead_members),
            format_nodes(&self.new_members)
        )
    }
}

/// 成员变化通知
///
/// 同步监听器在处理视图变化时直接调用，只有配置允许时才会登记为同步；
/// 异步监听器由后台任务按视图顺序依次调用。每一个安装过的视图都会通知一次，
/// 成员离开后马上重新加入也会先后收到两次变化。
pub struct GroupMembershipNotifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    allow_sync: bool,
    max_history: usize,
    sync_listeners: RwLock<Vec<Listener>>,
    async_listeners: Arc<RwLock<Vec<Listener>>>,
    history: Mutex<VecDeque<ViewHistoryEntry>>,
    last_view: Mutex<GroupView>,
    async_changes: mpsc::UnboundedSender<MembershipChange>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GroupMembershipNotifier {
    pub async fn start(transport: &Arc<dyn GroupTransport>, config: &ClusterConfig) -> Self {
        let (async_changes, mut changes) = mpsc::unbounded_channel::<MembershipChange>();
        let async_listeners: Arc<RwLock<Vec<Listener>>> = Arc::new(RwLock::new(Vec::new()));
        // 先订阅再取当前视图，两者之间安装的视图会因为编号不大于初始视图而被跳过
        let mut views = transport.subscribe_views();
        let initial = transport.current_view();

        let inner = Arc::new(NotifierInner {
            allow_sync: config.allow_sync_membership_notifications,
            max_history: config.max_history_length,
            sync_listeners: RwLock::new(Vec::new()),
            async_listeners: Arc::clone(&async_listeners),
            history: Mutex::new(VecDeque::new()),
            last_view: Mutex::new(initial.clone()),
            async_changes,
            tasks: Mutex::new(Vec::new()),
        });
        inner.log_history(ViewHistoryEntry::initial(&initial)).await;

        let notifier = tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let listeners = async_listeners.read().await.clone();
                for listener in listeners {
                    listener.membership_changed(&change).await;
                }
            }
        });

        let view_inner = Arc::clone(&inner);
        let watcher = tokio::spawn(async move {
            while let Some(view) = views.next().await {
                view_inner.process_view(view).await;
            }
        });

        inner.tasks.lock().await.extend([notifier, watcher]);
        Self { inner }
    }

    /// 登记监听器，配置不允许同步通知时按异步监听器处理
    pub async fn register_listener(&self, listener: Listener) {
        if self.inner.allow_sync {
            self.inner.sync_listeners.write().await.push(listener);
        } else {
            debug!("不允许同步成员通知，按异步监听器登记");
            self.register_async_listener(listener).await;
        }
    }

    pub async fn register_async_listener(&self, listener: Listener) {
        self.inner.async_listeners.write().await.push(listener);
    }

    /// 注销监听器，返回是否找到
    pub async fn unregister_listener(&self, listener: &Listener) -> bool {
        let same = |other: &Listener| {
            std::ptr::eq(
                Arc::as_ptr(other) as *const (),
                Arc::as_ptr(listener) as *const (),
            )
        };
        let mut removed = false;
        for listeners in [&self.inner.sync_listeners, self.inner.async_listeners.as_ref()] {
            let mut listeners = listeners.write().await;
            let before = listeners.len();
            listeners.retain(|l| !same(l));
            removed |= listeners.len() != before;
        }
        removed
    }

    pub async fn history(&self) -> Vec<String> {
        self.inner
            .history
            .lock()
            .await
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    pub async fn history_entries(&self) -> Vec<ViewHistoryEntry> {
        self.inner.history.lock().await.iter().cloned().collect()
    }

    /// 视图历史，每行一条
    pub async fn show_history(&self) -> String {
        self.history().await.join("\n")
    }

    /// 结构化的视图历史，供管理工具导出
    pub async fn show_history_as_json(&self) -> KernelResult<String> {
        let entries = self.history_entries().await;
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    pub async fn stop(&self) {
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

impl NotifierInner {
    async fn process_view(&self, view: GroupView) {
        let change = {
            let mut last = self.last_view.lock().await;
            if view.view_id() <= last.view_id() {
                return;
            }
            let change = MembershipChange::between(&last, &view);
            *last = view;
            change
        };

        info!(
            view_id = change.view_id,
            members = change.all_members.len(),
            dead = change.dead_members.len(),
            new = change.new_members.len(),
            "组视图变化"
        );
        self.log_history(ViewHistoryEntry::change(&change)).await;

        let listeners = self.sync_listeners.read().await.clone();
        for listener in listeners {
            listener.membership_changed(&change).await;
        }
        if self.async_changes.send(change).is_err() {
            debug!("异步成员通知任务已经退出");
        }
    }

    async fn log_history(&self, entry: ViewHistoryEntry) {
        if self.max_history == 0 {
            return;
        }
        let mut history = self.history.lock().await;
        while history.len() >= self.max_history {
            history.pop_front();
        }
        history.push_back(entry);
    }
}

fn format_nodes(nodes: &[ClusterNode]) -> String {
    let names: Vec<String> = nodes.iter().map(ToString::to_string).collect();
    format!("[{}]", names.join(", "))
}
