use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use kernel_core::{KernelError, KernelResult};

use crate::chains::{DeployerChains, DeploymentChainConsumer};
use crate::processor::RegisteredProcessor;
use crate::unit::DeploymentUnit;

/// 按部署链对部署单元执行部署/回滚
#[derive(Default)]
pub struct DeploymentPipeline {
    chains: RwLock<Option<DeployerChains>>,
}

impl DeploymentPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_ready(&self) -> bool {
        self.chains.read().await.is_some()
    }

    async fn current_chains(&self) -> KernelResult<DeployerChains> {
        self.chains
            .read()
            .await
            .clone()
            .ok_or_else(|| KernelError::illegal_state("部署处理链尚未安装"))
    }

    /// 逐阶段执行全部处理器
    ///
    /// 某个处理器失败时，以相反顺序撤销已经执行过的处理器，然后返回失败。
    pub async fn deploy(&self, unit: &mut DeploymentUnit) -> KernelResult<()> {
        let chains = self.current_chains().await?;
        let mut applied: Vec<RegisteredProcessor> = Vec::with_capacity(chains.total_processors());

        for (phase, processors) in chains.iter() {
            for registered in processors {
                debug!(
                    unit = unit.name(),
                    phase = %phase,
                    processor = registered.type_name(),
                    "执行部署处理器"
                );
                if let Err(e) = registered.processor().deploy(phase, unit).await {
                    error!(
                        unit = unit.name(),
                        phase = %phase,
                        processor = registered.type_name(),
                        error = %e,
                        "部署处理器失败，开始回滚"
                    );
                    rollback(&applied, unit).await;
                    return Err(KernelError::DeploymentFailed {
                        unit: unit.name().to_string(),
                        phase: phase.to_string(),
                        processor: registered.type_name().to_string(),
                        message: e.to_string(),
                    });
                }
                applied.push(registered.clone());
            }
        }

        info!(unit = unit.name(), processors = applied.len(), "部署完成");
        Ok(())
    }

    /// 以相反顺序撤销全部处理器
    pub async fn undeploy(&self, unit: &mut DeploymentUnit) -> KernelResult<()> {
        let chains = self.current_chains().await?;
        let all: Vec<RegisteredProcessor> = chains
            .iter()
            .flat_map(|(_, processors)| processors.iter().cloned())
            .collect();
        rollback(&all, unit).await;
        info!(unit = unit.name(), "卸载完成");
        Ok(())
    }
}

async fn rollback(applied: &[RegisteredProcessor], unit: &mut DeploymentUnit) {
    for registered in applied.iter().rev() {
        debug!(
            unit = unit.name(),
            processor = registered.type_name(),
            "撤销部署处理器"
        );
        registered.processor().undeploy(unit).await;
    }
}

#[async_trait]
impl DeploymentChainConsumer for DeploymentPipeline {
    async fn install_chains(&self, chains: DeployerChains) -> KernelResult<()> {
        let mut current = self.chains.write().await;
        if current.is_some() {
            info!("替换已有的部署处理链");
        }
        *current = Some(chains);
        Ok(())
    }
}
