use anyhow::Result;

use kernel::app::Application;
use kernel::shutdown::ShutdownManager;
use kernel_clustering::StateTransferStatus;
use kernel_core::KernelConfig;

fn test_config() -> KernelConfig {
    let mut config = KernelConfig::default();
    config.node.node_name = "node-a".to_string();
    config.cluster.method_call_timeout_ms = 2_000;
    config.cluster.state_transfer_timeout_ms = 2_000;
    config
}

#[tokio::test]
async fn test_deployments_visible_across_group() -> Result<()> {
    let app = Application::new(test_config()).await?;
    app.deploy("shop.war").await?;
    app.deploy("billing.jar").await?;
    assert_eq!(app.deployed_units().await, vec!["shop.war", "billing.jar"]);

    let state = app.add_peer("node-b").await?;
    assert_eq!(state.status(), StateTransferStatus::Received);
    assert_eq!(
        state.state_as::<Vec<String>>()?,
        Some(vec!["shop.war".to_string(), "billing.jar".to_string()])
    );

    let mut listings = app.cluster_deployments().await?;
    listings.sort_by_key(|listing| listing.len());
    assert_eq!(listings.len(), 2);
    assert!(listings[0].is_empty());
    assert_eq!(listings[1].len(), 2);

    app.stop().await?;
    assert!(app.deployed_units().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failed_deployment_is_not_recorded() -> Result<()> {
    let app = Application::new(test_config()).await?;
    assert!(app.deploy(".war").await.is_err());
    assert!(app.deployed_units().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_run_stops_on_shutdown_signal() -> Result<()> {
    let app = Application::new(test_config()).await?;
    app.deploy("shop.war").await?;

    let shutdown = ShutdownManager::new();
    let receiver = shutdown.subscribe();
    shutdown.shutdown();
    app.run(receiver).await?;

    assert!(app.deployed_units().await.is_empty());
    Ok(())
}
