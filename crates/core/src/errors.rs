use thiserror::Error;

/// 内核错误类型定义
///
/// 部署链与集群RPC共用同一个错误枚举。配置/编程错误属于致命错误，
/// 分发层错误（`Dispatch*`）与目标节点业务方法自身抛出的错误（`RemoteInvocation`）严格区分。
#[derive(Debug, Error, Clone, PartialEq)]
pub enum KernelError {
    #[error("未知的部署阶段: {0}")]
    UnknownPhase(String),

    #[error("重复注册的部署处理器: 阶段 {phase} 优先级 {priority:#06x} 类型 {processor}")]
    DuplicateProcessor {
        phase: String,
        priority: u32,
        processor: String,
    },

    #[error("部署处理链已经完成，不能再次修改")]
    DeployerChainFinalized,

    #[error("部署处理链尚未初始化")]
    DeployerChainNotInitialized,

    #[error("启动步骤在 {rounds} 轮重新调度后仍未收敛")]
    BootDidNotSettle { rounds: usize },

    #[error("部署单元 {unit} 在阶段 {phase} 的处理器 {processor} 失败: {message}")]
    DeploymentFailed {
        unit: String,
        phase: String,
        processor: String,
        message: String,
    },

    #[error("服务 {0} 已经注册了RPC处理器")]
    DuplicateHandler(String),

    #[error("服务 {0} 的RPC处理器不属于调用方")]
    HandlerMismatch(String),

    #[error("节点 {node} 没有为服务 {service} 注册RPC处理器")]
    DispatchNoHandler { node: String, service: String },

    #[error("节点 {node} 的服务 {service} 没有操作 {method}")]
    DispatchNoSuchMethod {
        node: String,
        service: String,
        method: String,
    },

    #[error("调用 {service}.{method} 的参数签名不匹配: 期望 {expected}, 实际 {actual}")]
    DispatchSignatureMismatch {
        service: String,
        method: String,
        expected: String,
        actual: String,
    },

    #[error("节点不可达: {0}")]
    DispatchUnreachable(String),

    #[error("消息编解码失败: {0}")]
    DispatchMarshalling(String),

    #[error("节点 {node} 拒绝了 {service}.{method} 的有序请求: {reason}")]
    DispatchRejected {
        node: String,
        service: String,
        method: String,
        reason: String,
    },

    #[error("节点 {node} 执行 {service}.{method} 时抛出异常: {message}")]
    RemoteInvocation {
        node: String,
        service: String,
        method: String,
        message: String,
    },

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("等待被中断")]
    Interrupted,

    #[error("非法状态: {0}")]
    IllegalState(String),

    #[error("状态传输失败: {0}")]
    StateTransfer(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        Self::IllegalState(msg.into())
    }
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }
    pub fn unreachable<S: Into<String>>(node: S) -> Self {
        Self::DispatchUnreachable(node.into())
    }
    pub fn marshalling<S: Into<String>>(msg: S) -> Self {
        Self::DispatchMarshalling(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 配置或编程错误：立即失败，永不重试
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::UnknownPhase(_)
                | KernelError::DuplicateProcessor { .. }
                | KernelError::DeployerChainFinalized
                | KernelError::DeployerChainNotInitialized
                | KernelError::BootDidNotSettle { .. }
                | KernelError::DuplicateHandler(_)
                | KernelError::HandlerMismatch(_)
                | KernelError::IllegalState(_)
                | KernelError::Configuration(_)
                | KernelError::Internal(_)
        )
    }

    /// 传输/分发层失败，区别于目标方法自身的业务异常
    pub fn is_dispatch_failure(&self) -> bool {
        matches!(
            self,
            KernelError::DispatchNoHandler { .. }
                | KernelError::DispatchNoSuchMethod { .. }
                | KernelError::DispatchSignatureMismatch { .. }
                | KernelError::DispatchUnreachable(_)
                | KernelError::DispatchMarshalling(_)
                | KernelError::DispatchRejected { .. }
        )
    }

    /// 内核本身从不重试；这里只是告诉调用方哪些错误值得由它自己重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KernelError::DispatchUnreachable(_) | KernelError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        KernelError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for KernelError {
    fn from(err: anyhow::Error) -> Self {
        KernelError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(KernelError::UnknownPhase("X".into()).is_fatal());
        assert!(KernelError::DeployerChainFinalized.is_fatal());
        assert!(KernelError::DuplicateHandler("svc".into()).is_fatal());
        assert!(!KernelError::timeout("call").is_fatal());
        assert!(!KernelError::Interrupted.is_fatal());
    }

    #[test]
    fn test_dispatch_failure_is_distinct_from_remote_invocation() {
        let dispatch = KernelError::DispatchNoHandler {
            node: "a".into(),
            service: "svc".into(),
        };
        let remote = KernelError::RemoteInvocation {
            node: "a".into(),
            service: "svc".into(),
            method: "m".into(),
            message: "boom".into(),
        };
        let rejected = KernelError::DispatchRejected {
            node: "a".into(),
            service: "svc".into(),
            method: "m".into(),
            reason: "重复的序号 3".into(),
        };
        assert!(dispatch.is_dispatch_failure());
        assert!(rejected.is_dispatch_failure());
        assert!(!rejected.is_retryable());
        assert!(!remote.is_dispatch_failure());
        assert!(!remote.is_fatal());
    }

    #[test]
    fn test_retryable() {
        assert!(KernelError::unreachable("node-1").is_retryable());
        assert!(KernelError::timeout("x").is_retryable());
        assert!(!KernelError::Interrupted.is_retryable());
    }

    #[test]
    fn test_from_serde_json() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        let kernel: KernelError = err.into();
        assert!(matches!(kernel, KernelError::Serialization(_)));
    }
}
