use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use kernel_core::KernelResult;

use crate::phase::Phase;
use crate::processor::RegisteredProcessor;

/// 冻结后的部署处理链
///
/// 在 finalize 时一次性生成，此后只读，可以在多个线程间无锁共享。
#[derive(Debug, Clone, Default)]
pub struct DeployerChains {
    chains: Arc<BTreeMap<Phase, Arc<[RegisteredProcessor]>>>,
}

impl DeployerChains {
    pub(crate) fn new(chains: BTreeMap<Phase, Vec<RegisteredProcessor>>) -> Self {
        let chains = chains
            .into_iter()
            .map(|(phase, processors)| (phase, Arc::from(processors)))
            .collect();
        Self {
            chains: Arc::new(chains),
        }
    }

    /// 某个阶段的处理器，按执行顺序排列
    pub fn processors(&self, phase: Phase) -> &[RegisteredProcessor] {
        self.chains.get(&phase).map(|p| p.as_ref()).unwrap_or(&[])
    }

    /// 按阶段顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = (Phase, &[RegisteredProcessor])> {
        self.chains.iter().map(|(phase, p)| (*phase, p.as_ref()))
    }

    pub fn total_processors(&self) -> usize {
        self.chains.values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_processors() == 0
    }
}

/// 部署链的下游消费者
#[async_trait]
pub trait DeploymentChainConsumer: Send + Sync {
    async fn install_chains(&self, chains: DeployerChains) -> KernelResult<()>;
}
