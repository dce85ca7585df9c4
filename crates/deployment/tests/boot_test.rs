mod common;

use std::sync::Arc;

use async_trait::async_trait;

use common::*;
use kernel_core::{DeploymentConfig, KernelError, KernelResult};
use kernel_deployment::{
    priority, BootContext, BootSequence, BootStep, DeploymentPipeline, Phase,
};

/// 登记一个处理器的子系统启动步骤
struct AddMountProcessorStep {
    journal: Journal,
}

#[async_trait]
impl BootStep for AddMountProcessorStep {
    fn name(&self) -> &str {
        "add-mount-processor"
    }

    async fn execute(&self, ctx: &mut BootContext) -> KernelResult<()> {
        ctx.processor_target("ee")
            .add_deployment_processor(
                Phase::Structure,
                priority::STRUCTURE_MOUNT,
                MountProcessor::new(&self.journal),
            )
            .await
    }
}

/// 先追加一个步骤，由追加的步骤再追加一个登记处理器的步骤
struct NestedSubsystemStep {
    journal: Journal,
    depth: usize,
}

#[async_trait]
impl BootStep for NestedSubsystemStep {
    fn name(&self) -> &str {
        "nested-subsystem"
    }

    async fn execute(&self, ctx: &mut BootContext) -> KernelResult<()> {
        if self.depth == 0 {
            ctx.processor_target("web")
                .add_deployment_processor(
                    Phase::Install,
                    priority::INSTALL_WAR_DEPLOYMENT,
                    InstallProcessor::new(&self.journal),
                )
                .await
        } else {
            ctx.add_step(NestedSubsystemStep {
                journal: Arc::clone(&self.journal),
                depth: self.depth - 1,
            });
            Ok(())
        }
    }
}

/// 永远追加自己的步骤
struct RestlessStep;

#[async_trait]
impl BootStep for RestlessStep {
    fn name(&self) -> &str {
        "restless"
    }

    async fn execute(&self, ctx: &mut BootContext) -> KernelResult<()> {
        ctx.add_step(RestlessStep);
        Ok(())
    }
}

fn sequence(max_finalize_reschedules: usize) -> (BootSequence, Arc<DeploymentPipeline>) {
    let pipeline = Arc::new(DeploymentPipeline::new());
    let config = DeploymentConfig {
        max_finalize_reschedules,
    };
    (BootSequence::new(&config, pipeline.clone()), pipeline)
}

#[tokio::test]
async fn test_boot_publishes_chains_to_consumer() {
    let log = journal();
    let (boot, pipeline) = sequence(16);

    let outcome = boot
        .run(vec![Box::new(AddMountProcessorStep {
            journal: log.clone(),
        })])
        .await
        .unwrap();

    assert_eq!(outcome.chains.processors(Phase::Structure).len(), 1);
    assert_eq!(outcome.steps_executed, 2);
    assert!(pipeline.is_ready().await);
    assert!(boot.registry().is_finalized().await);
}

#[tokio::test]
async fn test_nested_registrations_are_captured_before_finalize() {
    let log = journal();
    let (boot, _pipeline) = sequence(16);

    let outcome = boot
        .run(vec![
            Box::new(NestedSubsystemStep {
                journal: log.clone(),
                depth: 3,
            }),
            Box::new(AddMountProcessorStep {
                journal: log.clone(),
            }),
        ])
        .await
        .unwrap();

    assert_eq!(outcome.chains.processors(Phase::Install).len(), 1);
    assert_eq!(outcome.chains.processors(Phase::Structure).len(), 1);
}

#[tokio::test]
async fn test_boot_that_never_settles_fails() {
    let (boot, pipeline) = sequence(4);

    let err = boot.run(vec![Box::new(RestlessStep)]).await.unwrap_err();

    assert_eq!(err, KernelError::BootDidNotSettle { rounds: 4 });
    assert!(err.is_fatal());
    assert!(!pipeline.is_ready().await);
    assert!(!boot.registry().is_finalized().await);
}

#[tokio::test]
async fn test_failed_step_aborts_boot() {
    struct BadPhaseStep;

    #[async_trait]
    impl BootStep for BadPhaseStep {
        fn name(&self) -> &str {
            "bad-phase"
        }

        async fn execute(&self, ctx: &mut BootContext) -> KernelResult<()> {
            ctx.registry()
                .register_named("ee", "NOT_A_PHASE", 1, Arc::new(FailingProcessor))
                .await
        }
    }

    let (boot, pipeline) = sequence(16);
    let err = boot.run(vec![Box::new(BadPhaseStep)]).await.unwrap_err();
    assert!(matches!(err, KernelError::UnknownPhase(_)));
    assert!(!pipeline.is_ready().await);
}

#[tokio::test]
async fn test_runtime_registration_requires_reload() {
    let log = journal();
    let (boot, _pipeline) = sequence(16);
    boot.run(Vec::new()).await.unwrap();

    let outcome = boot
        .run_runtime(vec![Box::new(AddMountProcessorStep {
            journal: log.clone(),
        })])
        .await
        .unwrap();

    assert!(outcome.reload_required);
    assert_eq!(outcome.steps_executed, 1);
    assert!(boot.registry().is_finalized().await);
}

#[tokio::test]
async fn test_each_boot_uses_fresh_registry() {
    let log = journal();
    let (first, _) = sequence(16);
    let (second, _) = sequence(16);

    first
        .run(vec![Box::new(AddMountProcessorStep {
            journal: log.clone(),
        })])
        .await
        .unwrap();
    let outcome = second.run(Vec::new()).await.unwrap();

    assert!(outcome.chains.is_empty());
}
