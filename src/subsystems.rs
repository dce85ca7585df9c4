//! 内置子系统的启动步骤
//!
//! 每个子系统在启动时向部署处理链登记自己的处理器。处理器之间通过部署单元的附件传递数据。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use kernel_core::{KernelError, KernelResult};
use kernel_deployment::{priority, BootContext, BootStep, DeploymentUnit, DeploymentUnitProcessor, Phase};

pub const ATTACHMENT_MOUNTED: &str = "structure.mounted";
pub const ATTACHMENT_MODULE_NAME: &str = "ee.module.name";
pub const ATTACHMENT_NAMING_CONTEXT: &str = "naming.context";
pub const ATTACHMENT_COMPLETE: &str = "deployment.complete";

/// 启动时默认执行的子系统步骤
pub fn default_boot_steps() -> Vec<Box<dyn BootStep>> {
    vec![Box::new(StructureSubsystem), Box::new(EeSubsystem)]
}

pub struct StructureSubsystem;

#[async_trait]
impl BootStep for StructureSubsystem {
    fn name(&self) -> &str {
        "structure"
    }

    async fn execute(&self, ctx: &mut BootContext) -> KernelResult<()> {
        ctx.processor_target("structure")
            .add_deployment_processor(Phase::Structure, priority::STRUCTURE_MOUNT, Arc::new(MountProcessor))
            .await
    }
}

/// EE子系统，同时把命名子系统排到队尾
pub struct EeSubsystem;

#[async_trait]
impl BootStep for EeSubsystem {
    fn name(&self) -> &str {
        "ee"
    }

    async fn execute(&self, ctx: &mut BootContext) -> KernelResult<()> {
        let mut target = ctx.processor_target("ee");
        target
            .add_deployment_processor(
                Phase::Parse,
                priority::PARSE_EE_MODULE_NAME,
                Arc::new(ModuleNameProcessor),
            )
            .await?;
        target
            .add_deployment_processor(
                Phase::Install,
                priority::INSTALL_DEPLOYMENT_COMPLETE_SERVICE,
                Arc::new(DeploymentCompleteProcessor),
            )
            .await?;
        ctx.add_step(NamingSubsystem);
        Ok(())
    }
}

pub struct NamingSubsystem;

#[async_trait]
impl BootStep for NamingSubsystem {
    fn name(&self) -> &str {
        "naming"
    }

    async fn execute(&self, ctx: &mut BootContext) -> KernelResult<()> {
        ctx.processor_target("naming")
            .add_deployment_processor(
                Phase::PostModule,
                priority::POST_MODULE_NAMING_CONTEXT,
                Arc::new(NamingContextProcessor),
            )
            .await
    }
}

struct MountProcessor;

#[async_trait]
impl DeploymentUnitProcessor for MountProcessor {
    async fn deploy(&self, _phase: Phase, unit: &mut DeploymentUnit) -> KernelResult<()> {
        debug!(unit = unit.name(), "挂载部署单元");
        unit.put_attachment(ATTACHMENT_MOUNTED, &true)
    }

    async fn undeploy(&self, unit: &mut DeploymentUnit) {
        unit.remove_attachment(ATTACHMENT_MOUNTED);
    }
}

/// 模块名取部署名去掉扩展名，子部署带上父部署前缀
struct ModuleNameProcessor;

#[async_trait]
impl DeploymentUnitProcessor for ModuleNameProcessor {
    async fn deploy(&self, _phase: Phase, unit: &mut DeploymentUnit) -> KernelResult<()> {
        let base = module_base_name(unit.name());
        if base.is_empty() {
            return Err(KernelError::illegal_state(format!(
                "无法从 {} 推导模块名",
                unit.name()
            )));
        }
        let module = match unit.parent() {
            Some(parent) => format!("{}/{base}", module_base_name(parent)),
            None => base.to_string(),
        };
        unit.put_attachment(ATTACHMENT_MODULE_NAME, &module)
    }

    async fn undeploy(&self, unit: &mut DeploymentUnit) {
        unit.remove_attachment(ATTACHMENT_MODULE_NAME);
    }
}

struct NamingContextProcessor;

#[async_trait]
impl DeploymentUnitProcessor for NamingContextProcessor {
    async fn deploy(&self, _phase: Phase, unit: &mut DeploymentUnit) -> KernelResult<()> {
        let module: String = unit
            .get_attachment(ATTACHMENT_MODULE_NAME)?
            .ok_or_else(|| KernelError::illegal_state("命名上下文需要先解析模块名"))?;
        unit.put_attachment(ATTACHMENT_NAMING_CONTEXT, &format!("java:app/{module}"))
    }

    async fn undeploy(&self, unit: &mut DeploymentUnit) {
        unit.remove_attachment(ATTACHMENT_NAMING_CONTEXT);
    }
}

struct DeploymentCompleteProcessor;

#[async_trait]
impl DeploymentUnitProcessor for DeploymentCompleteProcessor {
    async fn deploy(&self, _phase: Phase, unit: &mut DeploymentUnit) -> KernelResult<()> {
        unit.put_attachment(ATTACHMENT_COMPLETE, &true)
    }

    async fn undeploy(&self, unit: &mut DeploymentUnit) {
        unit.remove_attachment(ATTACHMENT_COMPLETE);
    }
}

fn module_base_name(name: &str) -> &str {
    name.rsplit_once('.').map(|(base, _)| base).unwrap_or(name)
}
