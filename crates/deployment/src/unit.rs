use std::collections::HashMap;

use serde::{de::DeserializeOwned, Serialize};

use kernel_core::{KernelError, KernelResult};

/// 一个部署单元（顶层部署或子部署）
///
/// 处理器之间通过附件传递数据，附件以JSON形式按键存储。
#[derive(Debug, Clone, Default)]
pub struct DeploymentUnit {
    name: String,
    parent: Option<String>,
    attachments: HashMap<String, serde_json::Value>,
}

impl DeploymentUnit {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            parent: None,
            attachments: HashMap::new(),
        }
    }

    pub fn sub_deployment<S: Into<String>>(name: S, parent: &DeploymentUnit) -> Self {
        Self {
            name: name.into(),
            parent: Some(parent.name.clone()),
            attachments: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn put_attachment<T: Serialize>(&mut self, key: &str, value: &T) -> KernelResult<()> {
        let value = serde_json::to_value(value)?;
        self.attachments.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get_attachment<T: DeserializeOwned>(&self, key: &str) -> KernelResult<Option<T>> {
        match self.attachments.get(key) {
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                KernelError::Serialization(format!("附件 {key} 类型不匹配: {e}"))
            }),
            None => Ok(None),
        }
    }

    pub fn remove_attachment(&mut self, key: &str) -> Option<serde_json::Value> {
        self.attachments.remove(key)
    }

    pub fn has_attachment(&self, key: &str) -> bool {
        self.attachments.contains_key(key)
    }
}
