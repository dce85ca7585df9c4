use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use kernel_core::KernelResult;

use crate::phase::Phase;
use crate::unit::DeploymentUnit;

/// 部署单元处理器
///
/// 部署链按阶段、按优先级依次调用 `deploy`；回滚时以相反顺序调用 `undeploy`。
#[async_trait]
pub trait DeploymentUnitProcessor: Send + Sync {
    async fn deploy(&self, phase: Phase, unit: &mut DeploymentUnit) -> KernelResult<()>;

    async fn undeploy(&self, unit: &mut DeploymentUnit);
}

/// 已登记的处理器
///
/// 排序规则：优先级升序，优先级相同时按处理器类型的完整路径名字典序，
/// 保证多次启动之间顺序确定。
#[derive(Clone)]
pub struct RegisteredProcessor {
    priority: u32,
    type_name: &'static str,
    subsystem: String,
    processor: Arc<dyn DeploymentUnitProcessor>,
}

impl RegisteredProcessor {
    pub fn new<P>(subsystem: &str, priority: u32, processor: Arc<P>) -> Self
    where
        P: DeploymentUnitProcessor + 'static,
    {
        Self {
            priority,
            type_name: std::any::type_name::<P>(),
            subsystem: subsystem.to_string(),
            processor,
        }
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    pub fn processor(&self) -> &Arc<dyn DeploymentUnitProcessor> {
        &self.processor
    }

    /// 是否是同一个处理器实例（而不仅仅是排序相等）
    pub fn is_same_processor(&self, other: &RegisteredProcessor) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.processor) as *const (),
            Arc::as_ptr(&other.processor) as *const (),
        )
    }
}

impl PartialEq for RegisteredProcessor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RegisteredProcessor {}

impl PartialOrd for RegisteredProcessor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RegisteredProcessor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.type_name.cmp(other.type_name))
    }
}

impl fmt::Debug for RegisteredProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredProcessor")
            .field("priority", &format_args!("{:#06x}", self.priority))
            .field("type_name", &self.type_name)
            .field("subsystem", &self.subsystem)
            .finish()
    }
}
