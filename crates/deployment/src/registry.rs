use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use kernel_core::{KernelError, KernelResult};

use crate::chains::DeployerChains;
use crate::phase::Phase;
use crate::processor::{DeploymentUnitProcessor, RegisteredProcessor};

enum RegistryState {
    Uninitialized,
    Collecting(HashMap<Phase, BTreeSet<RegisteredProcessor>>),
    Finalized,
}

/// 部署处理器登记表
///
/// 每次启动尝试创建一个新实例并显式传递给各个启动步骤。启动期间只有启动线程写入，
/// 读锁允许校验类步骤在写入尚未结束时并发读取。`finalize` 之后登记表不可再修改，
/// 重新加载时必须重新创建。
pub struct DeployerChainRegistry {
    state: RwLock<RegistryState>,
}

impl DeployerChainRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::Uninitialized),
        }
    }

    /// 为每个阶段创建空的处理器集合
    pub async fn initialize(&self) -> KernelResult<()> {
        let mut state = self.state.write().await;
        match &*state {
            RegistryState::Uninitialized => {
                let sets = Phase::all()
                    .iter()
                    .map(|phase| (*phase, BTreeSet::new()))
                    .collect();
                *state = RegistryState::Collecting(sets);
                debug!("部署处理链登记表已初始化");
                Ok(())
            }
            RegistryState::Collecting(_) => Ok(()),
            RegistryState::Finalized => Err(KernelError::DeployerChainFinalized),
        }
    }

    /// 在指定阶段登记一个处理器
    ///
    /// 同一个实例以相同优先级重复登记是无操作；排序相等的另一个实例会被拒绝。
    pub async fn register<P>(
        &self,
        subsystem: &str,
        phase: Phase,
        priority: u32,
        processor: Arc<P>,
    ) -> KernelResult<()>
    where
        P: DeploymentUnitProcessor + 'static,
    {
        let registered = RegisteredProcessor::new(subsystem, priority, processor);
        let mut state = self.state.write().await;
        let sets = match &mut *state {
            RegistryState::Collecting(sets) => sets,
            RegistryState::Uninitialized => return Err(KernelError::DeployerChainNotInitialized),
            RegistryState::Finalized => return Err(KernelError::DeployerChainFinalized),
        };
        let set = sets
            .get_mut(&phase)
            .ok_or_else(|| KernelError::UnknownPhase(phase.to_string()))?;

        if let Some(existing) = set.get(&registered) {
            if existing.is_same_processor(&registered) {
                debug!(
                    phase = %phase,
                    processor = registered.type_name(),
                    "处理器已登记，忽略重复登记"
                );
                return Ok(());
            }
            return Err(KernelError::DuplicateProcessor {
                phase: phase.to_string(),
                priority,
                processor: registered.type_name().to_string(),
            });
        }

        debug!(
            subsystem,
            phase = %phase,
            priority = format_args!("{:#06x}", priority),
            processor = registered.type_name(),
            "登记部署处理器"
        );
        set.insert(registered);
        Ok(())
    }

    /// 按阶段名称登记，阶段名称未知时失败
    pub async fn register_named<P>(
        &self,
        subsystem: &str,
        phase: &str,
        priority: u32,
        processor: Arc<P>,
    ) -> KernelResult<()>
    where
        P: DeploymentUnitProcessor + 'static,
    {
        let phase: Phase = phase.parse()?;
        self.register(subsystem, phase, priority, processor).await
    }

    /// 某阶段当前已登记处理器的有序快照
    pub async fn snapshot(&self, phase: Phase) -> KernelResult<Vec<RegisteredProcessor>> {
        let state = self.state.read().await;
        match &*state {
            RegistryState::Collecting(sets) => Ok(sets
                .get(&phase)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()),
            RegistryState::Uninitialized => Err(KernelError::DeployerChainNotInitialized),
            RegistryState::Finalized => Err(KernelError::DeployerChainFinalized),
        }
    }

    pub async fn pending_count(&self) -> usize {
        match &*self.state.read().await {
            RegistryState::Collecting(sets) => sets.values().map(|s| s.len()).sum(),
            _ => 0,
        }
    }

    pub async fn is_finalized(&self) -> bool {
        matches!(&*self.state.read().await, RegistryState::Finalized)
    }

    /// 冻结登记表，生成每个阶段的不可变有序处理链
    ///
    /// 只能调用一次。
    pub async fn finalize(&self) -> KernelResult<DeployerChains> {
        let mut state = self.state.write().await;
        let sets = match std::mem::replace(&mut *state, RegistryState::Finalized) {
            RegistryState::Collecting(sets) => sets,
            RegistryState::Uninitialized => {
                *state = RegistryState::Uninitialized;
                return Err(KernelError::DeployerChainNotInitialized);
            }
            RegistryState::Finalized => return Err(KernelError::DeployerChainFinalized),
        };

        let chains: BTreeMap<Phase, Vec<RegisteredProcessor>> = sets
            .into_iter()
            .map(|(phase, set)| (phase, set.into_iter().collect()))
            .collect();
        let chains = DeployerChains::new(chains);

        info!(
            processors = chains.total_processors(),
            "部署处理链已完成"
        );
        Ok(chains)
    }

    /// 清空所有阶段的处理器，仅供测试使用
    pub async fn clear(&self) -> KernelResult<()> {
        let mut state = self.state.write().await;
        match &mut *state {
            RegistryState::Collecting(sets) => {
                sets.values_mut().for_each(BTreeSet::clear);
                Ok(())
            }
            RegistryState::Uninitialized => Err(KernelError::DeployerChainNotInitialized),
            RegistryState::Finalized => Err(KernelError::DeployerChainFinalized),
        }
    }
}

impl Default for DeployerChainRegistry {
    fn default() -> Self {
        Self::new()
    }
}
