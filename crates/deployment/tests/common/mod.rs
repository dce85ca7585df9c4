#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kernel_core::{KernelError, KernelResult};
use kernel_deployment::{DeploymentUnit, DeploymentUnitProcessor, Phase};

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

macro_rules! recording_processor {
    ($name:ident) => {
        pub struct $name {
            pub journal: Journal,
        }

        impl $name {
            pub fn new(journal: &Journal) -> Arc<Self> {
                Arc::new(Self {
                    journal: Arc::clone(journal),
                })
            }
        }

        #[async_trait]
        impl DeploymentUnitProcessor for $name {
            async fn deploy(&self, phase: Phase, _unit: &mut DeploymentUnit) -> KernelResult<()> {
                self.journal
                    .lock()
                    .unwrap()
                    .push(format!("deploy:{}:{}", phase, stringify!($name)));
                Ok(())
            }

            async fn undeploy(&self, _unit: &mut DeploymentUnit) {
                self.journal
                    .lock()
                    .unwrap()
                    .push(format!("undeploy:{}", stringify!($name)));
            }
        }
    };
}

recording_processor!(MountProcessor);
recording_processor!(ManifestProcessor);
recording_processor!(AnnotationIndexProcessor);
recording_processor!(WebParseProcessor);
recording_processor!(InstallProcessor);

pub struct FailingProcessor;

#[async_trait]
impl DeploymentUnitProcessor for FailingProcessor {
    async fn deploy(&self, _phase: Phase, _unit: &mut DeploymentUnit) -> KernelResult<()> {
        Err(KernelError::Internal("描述符损坏".to_string()))
    }

    async fn undeploy(&self, _unit: &mut DeploymentUnit) {}
}
