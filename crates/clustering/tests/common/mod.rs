#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kernel_core::ClusterConfig;
use kernel_clustering::{
    ClusterNode, GroupCommunicationService, GroupTransport, InMemoryNetwork,
    InMemoryNetworkConfig,
};

pub fn node(name: &str) -> ClusterNode {
    ClusterNode::new(name, "127.0.0.1", 7600)
}

pub fn test_config() -> ClusterConfig {
    ClusterConfig {
        method_call_timeout_ms: 5_000,
        state_transfer_timeout_ms: 5_000,
        lock_retry_interval_ms: 20,
        ..ClusterConfig::default()
    }
}

pub struct TestCluster {
    pub network: InMemoryNetwork,
    pub members: Vec<GroupCommunicationService>,
    config: ClusterConfig,
}

impl TestCluster {
    pub async fn start(names: &[&str]) -> Self {
        Self::start_with(names, InMemoryNetworkConfig::default(), test_config()).await
    }

    pub async fn start_with(
        names: &[&str],
        network_config: InMemoryNetworkConfig,
        config: ClusterConfig,
    ) -> Self {
        let network = InMemoryNetwork::with_config(network_config);
        let mut members = Vec::new();
        for name in names {
            let transport: Arc<dyn GroupTransport> = network.join(node(name)).await.unwrap();
            members.push(GroupCommunicationService::start(transport, &config).await.unwrap());
        }
        Self {
            network,
            members,
            config,
        }
    }

    pub fn member(&self, index: usize) -> &GroupCommunicationService {
        &self.members[index]
    }

    /// 停掉一个成员，让它离开后以同一地址重新加入并启动新的服务
    pub async fn rejoin(&mut self, index: usize) -> &GroupCommunicationService {
        let name = self.members[index].local_node().clone();
        self.members[index].stop().await.unwrap();
        assert!(self.network.leave(&name).await);
        let transport: Arc<dyn GroupTransport> = self.network.join(name).await.unwrap();
        self.members[index] = GroupCommunicationService::start(transport, &self.config)
            .await
            .unwrap();
        &self.members[index]
    }
}

/// 轮询直到条件成立或超时
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
