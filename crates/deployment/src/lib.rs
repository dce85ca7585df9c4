//! 分阶段部署处理器登记表与启动步骤
//!
//! 启动期间各子系统把处理器登记到某个阶段、某个优先级；所有启动步骤收敛后，
//! 登记表被冻结为每个阶段的有序处理链，交给部署流水线使用。

pub mod boot;
pub mod chains;
pub mod phase;
pub mod pipeline;
pub mod processor;
pub mod registry;
pub mod unit;

pub use boot::{
    BootContext, BootMode, BootOutcome, BootSequence, BootStep, DeploymentProcessorTarget,
    FinalizeDeployerChainStep, RuntimeOutcome,
};
pub use chains::{DeployerChains, DeploymentChainConsumer};
pub use phase::{priority, Phase};
pub use pipeline::DeploymentPipeline;
pub use processor::{DeploymentUnitProcessor, RegisteredProcessor};
pub use registry::DeployerChainRegistry;
pub use unit::DeploymentUnit;
