use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use kernel_core::{DeploymentConfig, KernelError, KernelResult};

use crate::chains::{DeployerChains, DeploymentChainConsumer};
use crate::phase::Phase;
use crate::processor::DeploymentUnitProcessor;
use crate::registry::DeployerChainRegistry;

/// 启动步骤的执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// 服务器启动期间，处理器登记立即生效
    Boot,
    /// 运行期管理操作，新处理器要到下次启动才生效
    Runtime,
}

/// 一个启动步骤
///
/// 步骤可以通过 [`BootContext::add_step`] 追加后续步骤，后续步骤排在队尾执行。
#[async_trait]
pub trait BootStep: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &mut BootContext) -> KernelResult<()>;
}

/// 启动步骤之间共享的上下文
pub struct BootContext {
    mode: BootMode,
    registry: Arc<DeployerChainRegistry>,
    queue: VecDeque<Box<dyn BootStep>>,
    reload_required: bool,
    chains: Option<DeployerChains>,
}

impl BootContext {
    pub fn new(mode: BootMode, registry: Arc<DeployerChainRegistry>) -> Self {
        Self {
            mode,
            registry,
            queue: VecDeque::new(),
            reload_required: false,
            chains: None,
        }
    }

    pub fn mode(&self) -> BootMode {
        self.mode
    }

    pub fn registry(&self) -> &Arc<DeployerChainRegistry> {
        &self.registry
    }

    /// 把步骤追加到执行队列末尾
    pub fn add_step<S: BootStep + 'static>(&mut self, step: S) {
        self.queue.push_back(Box::new(step));
    }

    pub fn pending_steps(&self) -> usize {
        self.queue.len()
    }

    /// 运行期登记过处理器，需要重新加载才能生效
    pub fn is_reload_required(&self) -> bool {
        self.reload_required
    }

    /// 以某个子系统的名义登记处理器
    pub fn processor_target(&mut self, subsystem: &str) -> DeploymentProcessorTarget<'_> {
        DeploymentProcessorTarget {
            ctx: self,
            subsystem: subsystem.to_string(),
        }
    }

    /// 已发布的部署链，只有 finalize 步骤执行后才存在
    pub fn chains(&self) -> Option<&DeployerChains> {
        self.chains.as_ref()
    }

    fn next_step(&mut self) -> Option<Box<dyn BootStep>> {
        self.queue.pop_front()
    }
}

/// 子系统登记部署处理器的入口
pub struct DeploymentProcessorTarget<'a> {
    ctx: &'a mut BootContext,
    subsystem: String,
}

impl DeploymentProcessorTarget<'_> {
    pub async fn add_deployment_processor<P>(
        &mut self,
        phase: Phase,
        priority: u32,
        processor: Arc<P>,
    ) -> KernelResult<()>
    where
        P: DeploymentUnitProcessor + 'static,
    {
        match self.ctx.mode {
            BootMode::Boot => {
                self.ctx
                    .registry
                    .register(&self.subsystem, phase, priority, processor)
                    .await
            }
            BootMode::Runtime => {
                warn!(
                    subsystem = %self.subsystem,
                    phase = %phase,
                    processor = std::any::type_name::<P>(),
                    "运行期无法添加部署处理器，需要重新加载服务器"
                );
                self.ctx.reload_required = true;
                Ok(())
            }
        }
    }
}

/// 完成部署处理链的步骤
///
/// 队列中还有其他步骤时把自己重新排到队尾，直到队列只剩自己（不动点）。
/// 超过 `max_rounds` 次仍未收敛则启动失败。
pub struct FinalizeDeployerChainStep {
    consumer: Arc<dyn DeploymentChainConsumer>,
    round: usize,
    max_rounds: usize,
}

impl FinalizeDeployerChainStep {
    pub fn new(consumer: Arc<dyn DeploymentChainConsumer>, max_rounds: usize) -> Self {
        Self {
            consumer,
            round: 0,
            max_rounds,
        }
    }

    fn rescheduled(&self) -> Self {
        Self {
            consumer: Arc::clone(&self.consumer),
            round: self.round + 1,
            max_rounds: self.max_rounds,
        }
    }
}

#[async_trait]
impl BootStep for FinalizeDeployerChainStep {
    fn name(&self) -> &str {
        "finalize-deployer-chain"
    }

    async fn execute(&self, ctx: &mut BootContext) -> KernelResult<()> {
        if ctx.pending_steps() > 0 {
            if self.round >= self.max_rounds {
                return Err(KernelError::BootDidNotSettle { rounds: self.round });
            }
            debug!(
                round = self.round + 1,
                pending = ctx.pending_steps(),
                "仍有启动步骤未执行，推迟完成部署处理链"
            );
            ctx.add_step(self.rescheduled());
            return Ok(());
        }

        let chains = ctx.registry.finalize().await?;
        self.consumer.install_chains(chains.clone()).await?;
        ctx.chains = Some(chains);
        Ok(())
    }
}

/// 启动结果
#[derive(Debug, Clone)]
pub struct BootOutcome {
    pub chains: DeployerChains,
    pub steps_executed: usize,
}

/// 运行期操作结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOutcome {
    pub steps_executed: usize,
    pub reload_required: bool,
}

/// 一次启动尝试
///
/// 每次启动都新建登记表；启动步骤按先进先出顺序执行，最后由
/// [`FinalizeDeployerChainStep`] 冻结登记表并发布给消费者。
pub struct BootSequence {
    registry: Arc<DeployerChainRegistry>,
    consumer: Arc<dyn DeploymentChainConsumer>,
    max_finalize_reschedules: usize,
}

impl BootSequence {
    pub fn new(config: &DeploymentConfig, consumer: Arc<dyn DeploymentChainConsumer>) -> Self {
        Self {
            registry: Arc::new(DeployerChainRegistry::new()),
            consumer,
            max_finalize_reschedules: config.max_finalize_reschedules,
        }
    }

    pub fn registry(&self) -> &Arc<DeployerChainRegistry> {
        &self.registry
    }

    pub async fn run(&self, steps: Vec<Box<dyn BootStep>>) -> KernelResult<BootOutcome> {
        self.registry.initialize().await?;

        let mut ctx = BootContext::new(BootMode::Boot, Arc::clone(&self.registry));
        ctx.queue.extend(steps);
        ctx.add_step(FinalizeDeployerChainStep::new(
            Arc::clone(&self.consumer),
            self.max_finalize_reschedules,
        ));

        info!(steps = ctx.pending_steps(), "开始执行启动步骤");
        let steps_executed = execute_all(&mut ctx).await?;

        let chains = ctx
            .chains
            .take()
            .ok_or_else(|| KernelError::illegal_state("启动结束但部署处理链没有发布"))?;
        info!(
            steps_executed,
            processors = chains.total_processors(),
            "启动步骤执行完成"
        );
        Ok(BootOutcome {
            chains,
            steps_executed,
        })
    }

    /// 以运行期模式执行管理步骤，不会触碰已冻结的部署链
    pub async fn run_runtime(&self, steps: Vec<Box<dyn BootStep>>) -> KernelResult<RuntimeOutcome> {
        let mut ctx = BootContext::new(BootMode::Runtime, Arc::clone(&self.registry));
        ctx.queue.extend(steps);
        let steps_executed = execute_all(&mut ctx).await?;
        if ctx.reload_required {
            info!("运行期操作要求重新加载服务器");
        }
        Ok(RuntimeOutcome {
            steps_executed,
            reload_required: ctx.reload_required,
        })
    }
}

async fn execute_all(ctx: &mut BootContext) -> KernelResult<usize> {
    let mut executed = 0;
    while let Some(step) = ctx.next_step() {
        debug!(step = step.name(), "执行启动步骤");
        step.execute(ctx).await.map_err(|e| {
            warn!(step = step.name(), error = %e, "启动步骤失败");
            e
        })?;
        executed += 1;
    }
    Ok(executed)
}
