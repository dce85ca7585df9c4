use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::marshalling::MarshallingContext;

/// 处理器方法执行失败的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InvocationFailure {
    /// 参数无法转换为方法声明的类型，或结果无法编码
    Marshalling(String),
    /// 方法自身返回的错误
    Application(String),
}

type MethodFuture = BoxFuture<'static, Result<Value, InvocationFailure>>;
type MethodFn = Arc<dyn Fn(Value) -> MethodFuture + Send + Sync>;

pub(crate) struct HandlerMethod {
    pub(crate) signature: &'static str,
    pub(crate) invoke: MethodFn,
}

/// 某个服务名下的一组RPC操作
///
/// 操作按名称登记为静态类型的异步闭包，调用时按名称查表，不做运行时方法搜索。
pub struct RpcHandler {
    service: String,
    methods: HashMap<String, HandlerMethod>,
    marshalling: MarshallingContext,
}

impl RpcHandler {
    pub fn builder<S: Into<String>>(service: S) -> RpcHandlerBuilder {
        RpcHandlerBuilder {
            service: service.into(),
            methods: HashMap::new(),
            marshalling: MarshallingContext::default(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn marshalling(&self) -> &MarshallingContext {
        &self.marshalling
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn method(&self, name: &str) -> Option<&HandlerMethod> {
        self.methods.get(name)
    }
}

impl fmt::Debug for RpcHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcHandler")
            .field("service", &self.service)
            .field("methods", &self.method_names())
            .field("marshalling", &self.marshalling)
            .finish()
    }
}

pub struct RpcHandlerBuilder {
    service: String,
    methods: HashMap<String, HandlerMethod>,
    marshalling: MarshallingContext,
}

impl RpcHandlerBuilder {
    /// 登记一个操作
    ///
    /// 参数类型 `A` 的类型名就是该操作的签名，调用方必须使用同一个参数类型。
    pub fn method<A, R, E, F, Fut>(mut self, name: &str, operation: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let operation = Arc::new(operation);
        let invoke: MethodFn = Arc::new(move |args: Value| {
            let operation = Arc::clone(&operation);
            Box::pin(async move {
                let args: A = serde_json::from_value(args)
                    .map_err(|e| InvocationFailure::Marshalling(e.to_string()))?;
                let result = operation(args)
                    .await
                    .map_err(|e| InvocationFailure::Application(e.to_string()))?;
                serde_json::to_value(result).map_err(|e| InvocationFailure::Marshalling(e.to_string()))
            })
        });
        self.methods.insert(
            name.to_string(),
            HandlerMethod {
                signature: std::any::type_name::<A>(),
                invoke,
            },
        );
        self
    }

    pub fn marshalling(mut self, marshalling: MarshallingContext) -> Self {
        self.marshalling = marshalling;
        self
    }

    pub fn build(self) -> Arc<RpcHandler> {
        Arc::new(RpcHandler {
            service: self.service,
            methods: self.methods,
            marshalling: self.marshalling,
        })
    }
}
