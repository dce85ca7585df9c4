use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// 完成部署链之前，finalize 步骤最多重新排队的次数
    pub max_finalize_reschedules: usize,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            max_finalize_reschedules: 16,
        }
    }
}

impl DeploymentConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_finalize_reschedules == 0 {
            return Err(anyhow::anyhow!("finalize重新调度次数必须大于0"));
        }
        Ok(())
    }
}
