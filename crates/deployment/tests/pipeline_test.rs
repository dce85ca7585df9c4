mod common;

use std::sync::Arc;

use common::*;
use kernel_core::KernelError;
use kernel_deployment::{
    priority, DeployerChainRegistry, DeploymentChainConsumer, DeploymentPipeline, DeploymentUnit,
    Phase,
};

#[tokio::test]
async fn test_deploy_applies_processors_phase_by_phase() {
    let log = journal();
    let registry = DeployerChainRegistry::new();
    registry.initialize().await.unwrap();
    registry
        .register("ee", Phase::Install, priority::INSTALL_SERVICE_DEPLOYMENT, InstallProcessor::new(&log))
        .await
        .unwrap();
    registry
        .register("web", Phase::Parse, priority::PARSE_WEB_DEPLOYMENT, WebParseProcessor::new(&log))
        .await
        .unwrap();
    registry
        .register("ee", Phase::Structure, priority::STRUCTURE_MOUNT, MountProcessor::new(&log))
        .await
        .unwrap();

    let pipeline = DeploymentPipeline::new();
    pipeline.install_chains(registry.finalize().await.unwrap()).await.unwrap();

    let mut unit = DeploymentUnit::new("app.war");
    pipeline.deploy(&mut unit).await.unwrap();

    assert_eq!(
        entries(&log),
        vec![
            "deploy:STRUCTURE:MountProcessor",
            "deploy:PARSE:WebParseProcessor",
            "deploy:INSTALL:InstallProcessor",
        ]
    );

    pipeline.undeploy(&mut unit).await.unwrap();
    assert_eq!(
        entries(&log)[3..],
        [
            "undeploy:InstallProcessor",
            "undeploy:WebParseProcessor",
            "undeploy:MountProcessor",
        ]
    );
}

#[tokio::test]
async fn test_failure_rolls_back_applied_processors_in_reverse() {
    let log = journal();
    let registry = DeployerChainRegistry::new();
    registry.initialize().await.unwrap();
    registry
        .register("ee", Phase::Structure, priority::STRUCTURE_MOUNT, MountProcessor::new(&log))
        .await
        .unwrap();
    registry
        .register("ee", Phase::Structure, priority::STRUCTURE_MANIFEST, ManifestProcessor::new(&log))
        .await
        .unwrap();
    registry
        .register("ejb", Phase::Parse, priority::PARSE_EJB_DEPLOYMENT, Arc::new(FailingProcessor))
        .await
        .unwrap();
    registry
        .register("ee", Phase::Install, 1, InstallProcessor::new(&log))
        .await
        .unwrap();

    let pipeline = DeploymentPipeline::new();
    pipeline.install_chains(registry.finalize().await.unwrap()).await.unwrap();

    let mut unit = DeploymentUnit::new("broken.jar");
    let err = pipeline.deploy(&mut unit).await.unwrap_err();

    match err {
        KernelError::DeploymentFailed {
            unit, phase, processor, ..
        } => {
            assert_eq!(unit, "broken.jar");
            assert_eq!(phase, "PARSE");
            assert!(processor.ends_with("FailingProcessor"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        entries(&log),
        vec![
            "deploy:STRUCTURE:MountProcessor",
            "deploy:STRUCTURE:ManifestProcessor",
            "undeploy:ManifestProcessor",
            "undeploy:MountProcessor",
        ]
    );
}

#[tokio::test]
async fn test_deploy_without_chains_is_illegal_state() {
    let pipeline = DeploymentPipeline::new();
    let mut unit = DeploymentUnit::new("early.war");

    let err = pipeline.deploy(&mut unit).await.unwrap_err();
    assert!(matches!(err, KernelError::IllegalState(_)));
}
