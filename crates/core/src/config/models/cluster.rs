use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 本地节点标识配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_name: String,
    pub bind_address: String,
    pub port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let node_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            node_name,
            bind_address: "127.0.0.1".to_string(),
            port: 7600,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.is_empty() {
            return Err(anyhow::anyhow!("节点名称不能为空"));
        }
        if self.bind_address.is_empty() {
            return Err(anyhow::anyhow!("绑定地址不能为空"));
        }
        if self.port == 0 {
            return Err(anyhow::anyhow!("端口必须大于0"));
        }
        Ok(())
    }
}

/// 组通信与RPC分发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub group_name: String,
    /// 同步调用默认超时（毫秒）
    pub method_call_timeout_ms: u64,
    /// 状态传输的传输层超时（毫秒）
    pub state_transfer_timeout_ms: u64,
    /// 视图变更历史最多保留条数，0表示不记录
    pub max_history_length: usize,
    /// 是否允许同步成员变更监听器
    pub allow_sync_membership_notifications: bool,
    /// 集群锁冲突后的重试间隔（毫秒）
    pub lock_retry_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            group_name: "kernel-cluster".to_string(),
            method_call_timeout_ms: 60_000,
            state_transfer_timeout_ms: 60_000,
            max_history_length: 100,
            allow_sync_membership_notifications: false,
            lock_retry_interval_ms: 50,
        }
    }
}

impl ClusterConfig {
    pub fn method_call_timeout(&self) -> Duration {
        Duration::from_millis(self.method_call_timeout_ms)
    }

    pub fn state_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.state_transfer_timeout_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.group_name.is_empty() {
            return Err(anyhow::anyhow!("集群组名不能为空"));
        }
        if self.method_call_timeout_ms == 0 {
            return Err(anyhow::anyhow!("RPC调用超时时间必须大于0"));
        }
        if self.state_transfer_timeout_ms == 0 {
            return Err(anyhow::anyhow!("状态传输超时时间必须大于0"));
        }
        if self.lock_retry_interval_ms == 0 {
            return Err(anyhow::anyhow!("锁重试间隔必须大于0"));
        }
        Ok(())
    }
}
