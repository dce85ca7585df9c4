use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use kernel_clustering::{
    CallOptions, ClusterNode, GroupCommunicationService, GroupTransport, InMemoryNetwork,
    RpcHandler, StateTransferProvider, StateTransferResult,
};
use kernel_core::{KernelConfig, KernelResult};
use kernel_deployment::{BootSequence, DeploymentPipeline, DeploymentUnit};

use crate::subsystems::default_boot_steps;

/// 部署列表在组内使用的服务名
pub const DEPLOYMENTS_SERVICE: &str = "deployments";

type DeployedUnits = Arc<RwLock<Vec<DeploymentUnit>>>;

/// 一个节点上的内核实例
///
/// 启动时执行子系统步骤并发布部署链，然后加入进程内通信组，
/// 通过组RPC与状态传输对外提供本节点的部署列表。
pub struct Application {
    config: KernelConfig,
    pipeline: Arc<DeploymentPipeline>,
    network: InMemoryNetwork,
    cluster: GroupCommunicationService,
    deployed: DeployedUnits,
    peers: RwLock<Vec<GroupCommunicationService>>,
}

impl Application {
    pub async fn new(config: KernelConfig) -> Result<Self> {
        let pipeline = Arc::new(DeploymentPipeline::new());
        let outcome = BootSequence::new(&config.deployment, pipeline.clone())
            .run(default_boot_steps())
            .await
            .context("启动部署处理链失败")?;
        info!(
            steps = outcome.steps_executed,
            processors = outcome.chains.total_processors(),
            "部署处理链已就绪"
        );

        let network = InMemoryNetwork::new();
        let local = ClusterNode::new(
            config.node.node_name.as_str(),
            config.node.bind_address.as_str(),
            config.node.port,
        );
        let deployed: DeployedUnits = Arc::new(RwLock::new(Vec::new()));
        let cluster = join_group(&network, local, &config, &deployed).await?;
        info!(
            group = cluster.group_name(),
            node = %cluster.local_node(),
            coordinator = cluster.is_coordinator(),
            "已加入通信组"
        );

        Ok(Self {
            config,
            pipeline,
            network,
            cluster,
            deployed,
            peers: RwLock::new(Vec::new()),
        })
    }

    pub fn cluster(&self) -> &GroupCommunicationService {
        &self.cluster
    }

    /// 部署一个单元，失败时处理链已经回滚
    pub async fn deploy(&self, name: &str) -> Result<()> {
        let mut unit = DeploymentUnit::new(name);
        self.pipeline
            .deploy(&mut unit)
            .await
            .with_context(|| format!("部署 {name} 失败"))?;
        info!(unit = name, "部署完成");
        self.deployed.write().await.push(unit);
        Ok(())
    }

    pub async fn deployed_units(&self) -> Vec<String> {
        unit_names(&self.deployed).await
    }

    /// 在同一个进程内网络上启动一个对等节点
    pub async fn add_peer(&self, name: &str) -> Result<StateTransferResult> {
        let node = ClusterNode::new(name, self.config.node.bind_address.as_str(), self.config.node.port);
        let peer = join_group(&self.network, node, &self.config, &Arc::default()).await?;

        let state = peer
            .state_transfer()
            .get_service_state(DEPLOYMENTS_SERVICE)
            .await
            .wait()
            .await;
        info!(peer = name, status = ?state.status(), "对等节点完成状态传输");
        self.peers.write().await.push(peer);
        Ok(state)
    }

    /// 汇总组内所有成员的部署列表
    pub async fn cluster_deployments(&self) -> Result<Vec<Vec<String>>> {
        let listings = self
            .cluster
            .dispatcher()
            .call_method_on_cluster(DEPLOYMENTS_SERVICE, "list", &(), CallOptions::new())
            .await?;
        Ok(listings)
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        match self.cluster_deployments().await {
            Ok(listings) => info!(members = listings.len(), ?listings, "组内部署情况"),
            Err(e) => warn!(error = %e, "查询组内部署情况失败"),
        }
        let history = self.cluster.membership().show_history().await;
        info!(history = %history, "成员视图历史");

        if let Err(e) = shutdown_rx.recv().await {
            warn!(error = %e, "关闭信号通道异常，直接关闭");
        }
        self.stop().await
    }

    /// 逆序卸载所有部署并离开通信组
    pub async fn stop(&self) -> Result<()> {
        let mut deployed = self.deployed.write().await;
        while let Some(mut unit) = deployed.pop() {
            if let Err(e) = self.pipeline.undeploy(&mut unit).await {
                error!(unit = unit.name(), error = %e, "卸载部署失败");
            }
        }
        drop(deployed);

        for peer in self.peers.write().await.drain(..) {
            peer.stop().await?;
            self.network.leave(peer.local_node()).await;
        }
        self.cluster.stop().await?;
        self.network.leave(self.cluster.local_node()).await;
        info!("内核已停止");
        Ok(())
    }
}

struct DeploymentsProvider {
    deployed: DeployedUnits,
}

#[async_trait]
impl StateTransferProvider for DeploymentsProvider {
    async fn current_state(&self) -> KernelResult<Value> {
        Ok(serde_json::to_value(unit_names(&self.deployed).await)?)
    }
}

async fn join_group(
    network: &InMemoryNetwork,
    node: ClusterNode,
    config: &KernelConfig,
    deployed: &DeployedUnits,
) -> Result<GroupCommunicationService> {
    let transport: Arc<dyn GroupTransport> = network.join(node).await?;
    let service = GroupCommunicationService::start(transport, &config.cluster).await?;

    let listing = Arc::clone(deployed);
    let handler = RpcHandler::builder(DEPLOYMENTS_SERVICE)
        .method("list", move |_: ()| {
            let listing = Arc::clone(&listing);
            async move { Ok::<_, String>(unit_names(&listing).await) }
        })
        .build();
    service.dispatcher().register_handler(handler).await?;
    service
        .state_transfer()
        .register_state_transfer_provider(
            DEPLOYMENTS_SERVICE,
            Arc::new(DeploymentsProvider {
                deployed: Arc::clone(deployed),
            }),
        )
        .await?;
    Ok(service)
}

async fn unit_names(deployed: &DeployedUnits) -> Vec<String> {
    deployed
        .read()
        .await
        .iter()
        .map(|unit| unit.name().to_string())
        .collect()
}
