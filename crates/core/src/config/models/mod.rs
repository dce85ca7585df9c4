pub mod app_config;
pub mod cluster;
pub mod deployment;
pub mod logging;

pub use app_config::KernelConfig;
pub use cluster::{ClusterConfig, NodeConfig};
pub use deployment::DeploymentConfig;
pub use logging::{LogFormat, LoggingConfig};
