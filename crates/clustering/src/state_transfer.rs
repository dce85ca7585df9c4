use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use kernel_core::{ClusterConfig, KernelError, KernelResult};

use crate::dispatcher::{CallOptions, GroupRpcDispatcher};
use crate::handler::RpcHandler;
use crate::marshalling::MarshallingContext;

/// 状态传输使用的内部服务名
pub const STATE_TRANSFER_SERVICE: &str = "__kernel_state_transfer";
const GET_STATE: &str = "get_state";
const GET_STATE_STREAM: &str = "get_state_stream";

/// 为加入者提供服务当前状态
#[async_trait]
pub trait StateTransferProvider: Send + Sync {
    async fn current_state(&self) -> KernelResult<Value>;

    /// 以原始字节提供状态，供流式请求使用
    ///
    /// 返回 `None` 时按登记的编解码上下文编码 [`current_state`](Self::current_state)。
    async fn current_state_bytes(&self) -> KernelResult<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// 请求方希望拿到的状态形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StateForm {
    Value,
    Stream,
}

impl StateForm {
    fn method(self) -> &'static str {
        match self {
            StateForm::Value => GET_STATE,
            StateForm::Stream => GET_STATE_STREAM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransferStatus {
    NoState,
    Requested,
    Received,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateTransferResult {
    status: StateTransferStatus,
    state: Option<Value>,
    bytes: Option<Vec<u8>>,
    error: Option<KernelError>,
}

impl StateTransferResult {
    fn no_state() -> Self {
        Self {
            status: StateTransferStatus::NoState,
            state: None,
            bytes: None,
            error: None,
        }
    }

    fn received(state: Value) -> Self {
        Self {
            status: StateTransferStatus::Received,
            state: Some(state),
            bytes: None,
            error: None,
        }
    }

    fn received_bytes(bytes: Vec<u8>) -> Self {
        Self {
            status: StateTransferStatus::Received,
            state: None,
            bytes: Some(bytes),
            error: None,
        }
    }

    fn failed(error: KernelError) -> Self {
        let status = match error {
            KernelError::Timeout(_) => StateTransferStatus::TimedOut,
            _ => StateTransferStatus::Failed,
        };
        Self {
            status,
            state: None,
            bytes: None,
            error: Some(error),
        }
    }

    pub fn status(&self) -> StateTransferStatus {
        self.status
    }

    pub fn state(&self) -> Option<&Value> {
        self.state.as_ref()
    }

    pub fn error(&self) -> Option<&KernelError> {
        self.error.as_ref()
    }

    /// 流式请求收到的原始状态
    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    /// 以可异步读取的流交出原始状态，没有状态时返回 `None`
    pub fn into_stream(self) -> Option<Cursor<Vec<u8>>> {
        self.bytes.map(Cursor::new)
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            StateTransferStatus::Received | StateTransferStatus::NoState
        )
    }

    /// 把收到的状态转换为具体类型，没有状态时返回 `None`
    pub fn state_as<T: DeserializeOwned>(&self) -> KernelResult<Option<T>> {
        match &self.state {
            Some(state) => serde_json::from_value(state.clone())
                .map(Some)
                .map_err(|e| KernelError::StateTransfer(e.to_string())),
            None => Ok(None),
        }
    }
}

type ResultSlot = watch::Receiver<Option<StateTransferResult>>;

/// 一次状态请求的结果
///
/// 组件本身不强制超时，调用方可以用 [`StateTransferFuture::wait_timeout`] 自行决定。
pub struct StateTransferFuture {
    service: String,
    slot: ResultSlot,
}

impl StateTransferFuture {
    fn resolved(service: &str, result: StateTransferResult) -> Self {
        let (_, slot) = watch::channel(Some(result));
        Self {
            service: service.to_string(),
            slot,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn status(&self) -> StateTransferStatus {
        self.slot
            .borrow()
            .as_ref()
            .map(|result| result.status)
            .unwrap_or(StateTransferStatus::Requested)
    }

    pub async fn wait(mut self) -> StateTransferResult {
        let outcome = self.slot.wait_for(Option::is_some).await.map(|r| r.clone());
        match outcome {
            Ok(Some(result)) => result,
            _ => StateTransferResult::failed(KernelError::StateTransfer(format!(
                "服务 {} 的状态请求被放弃",
                self.service
            ))),
        }
    }

    pub async fn wait_timeout(self, timeout: Duration) -> StateTransferResult {
        let service = self.service.clone();
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(service = %service, timeout_ms = timeout.as_millis() as u64, "等待服务状态超时");
                StateTransferResult::failed(KernelError::timeout(format!("等待服务 {service} 的状态")))
            }
        }
    }
}

struct RegisteredProvider {
    provider: Arc<dyn StateTransferProvider>,
    marshalling: MarshallingContext,
}

/// 组状态传输
///
/// 状态请求发给协调者（本节点是协调者时发给第一个其他成员）。同一服务、同一形式
/// （解码后的值或原始字节流）的并发请求共享同一次远程请求。
#[derive(Clone)]
pub struct GroupStateTransferService {
    inner: Arc<StateTransferInner>,
}

struct StateTransferInner {
    dispatcher: GroupRpcDispatcher,
    request_timeout: Duration,
    providers: RwLock<HashMap<String, RegisteredProvider>>,
    in_flight: Mutex<HashMap<(String, StateForm), ResultSlot>>,
    handler: Mutex<Option<Arc<RpcHandler>>>,
}

impl GroupStateTransferService {
    pub async fn start(dispatcher: GroupRpcDispatcher, config: &ClusterConfig) -> KernelResult<Self> {
        let inner = Arc::new(StateTransferInner {
            dispatcher,
            request_timeout: config.state_transfer_timeout(),
            providers: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
        });

        let weak: Weak<StateTransferInner> = Arc::downgrade(&inner);
        let stream_weak = weak.clone();
        let handler = RpcHandler::builder(STATE_TRANSFER_SERVICE)
            .method(GET_STATE, move |service: String| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.local_state(&service, StateForm::Value).await,
                        None => Err(format!("状态传输服务已停止: {service}")),
                    }
                }
            })
            .method(GET_STATE_STREAM, move |service: String| {
                let weak = stream_weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.local_state(&service, StateForm::Stream).await,
                        None => Err(format!("状态传输服务已停止: {service}")),
                    }
                }
            })
            .build();
        inner.dispatcher.register_handler(Arc::clone(&handler)).await?;
        *inner.handler.lock().await = Some(handler);

        Ok(Self { inner })
    }

    pub async fn stop(&self) -> KernelResult<()> {
        if let Some(handler) = self.inner.handler.lock().await.take() {
            self.inner
                .dispatcher
                .unregister_handler(STATE_TRANSFER_SERVICE, &handler)
                .await?;
        }
        Ok(())
    }

    pub async fn register_state_transfer_provider(
        &self,
        service: &str,
        provider: Arc<dyn StateTransferProvider>,
    ) -> KernelResult<()> {
        self.register_state_transfer_provider_with(service, provider, MarshallingContext::default())
            .await
    }

    /// 登记状态提供者，状态使用给定的编解码上下文编码
    pub async fn register_state_transfer_provider_with(
        &self,
        service: &str,
        provider: Arc<dyn StateTransferProvider>,
        marshalling: MarshallingContext,
    ) -> KernelResult<()> {
        let mut providers = self.inner.providers.write().await;
        if providers.contains_key(service) {
            return Err(KernelError::illegal_state(format!(
                "服务 {service} 已经登记了状态提供者"
            )));
        }
        providers.insert(
            service.to_string(),
            RegisteredProvider {
                provider,
                marshalling,
            },
        );
        debug!(service, "登记状态提供者");
        Ok(())
    }

    pub async fn unregister_state_transfer_provider(&self, service: &str) -> bool {
        self.inner.providers.write().await.remove(service).is_some()
    }

    pub async fn get_service_state(&self, service: &str) -> StateTransferFuture {
        self.get_service_state_with(service, MarshallingContext::default())
            .await
    }

    /// 请求服务状态，收到的状态用给定的编解码上下文解码
    pub async fn get_service_state_with(
        &self,
        service: &str,
        marshalling: MarshallingContext,
    ) -> StateTransferFuture {
        self.request_state(service, StateForm::Value, marshalling).await
    }

    /// 请求服务状态的原始字节，结果通过 [`StateTransferResult::into_stream`] 读取
    pub async fn get_service_state_as_stream(&self, service: &str) -> StateTransferFuture {
        self.request_state(service, StateForm::Stream, MarshallingContext::default())
            .await
    }

    async fn request_state(
        &self,
        service: &str,
        form: StateForm,
        marshalling: MarshallingContext,
    ) -> StateTransferFuture {
        let key = (service.to_string(), form);
        let mut in_flight = self.inner.in_flight.lock().await;
        if let Some(slot) = in_flight.get(&key) {
            debug!(service, "复用进行中的状态请求");
            return StateTransferFuture {
                service: service.to_string(),
                slot: slot.clone(),
            };
        }

        let dispatcher = &self.inner.dispatcher;
        let view = dispatcher.current_view();
        let local = dispatcher.local_node();
        let target = match view.coordinator() {
            Some(coordinator) if coordinator != local => Some(coordinator.clone()),
            _ => view.members().iter().find(|node| *node != local).cloned(),
        };
        let Some(target) = target else {
            debug!(service, "组内没有其他成员，没有可传输的状态");
            return StateTransferFuture::resolved(service, StateTransferResult::no_state());
        };

        let (publisher, slot) = watch::channel(None);
        in_flight.insert(key.clone(), slot.clone());
        drop(in_flight);

        info!(service, target = %target, form = ?form, "向成员请求服务状态");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let name = &key.0;
            let response: KernelResult<Vec<u8>> = inner
                .dispatcher
                .call_method_on_node(
                    STATE_TRANSFER_SERVICE,
                    form.method(),
                    name,
                    &target,
                    CallOptions::new().with_timeout(inner.request_timeout),
                )
                .await;
            let result = match form {
                StateForm::Value => response
                    .and_then(|bytes| marshalling.decode_value(&bytes))
                    .map(StateTransferResult::received),
                StateForm::Stream => response.map(StateTransferResult::received_bytes),
            };
            let result = result.unwrap_or_else(|e| {
                warn!(service = %name, target = %target, error = %e, "状态传输失败");
                StateTransferResult::failed(e)
            });
            inner.in_flight.lock().await.remove(&key);
            publisher.send_replace(Some(result));
        });

        StateTransferFuture {
            service: service.to_string(),
            slot,
        }
    }
}

impl StateTransferInner {
    async fn local_state(&self, service: &str, form: StateForm) -> Result<Vec<u8>, String> {
        let providers = self.providers.read().await;
        let Some(registered) = providers.get(service) else {
            return Err(format!("服务 {service} 没有登记状态提供者"));
        };
        if form == StateForm::Stream {
            let bytes = registered
                .provider
                .current_state_bytes()
                .await
                .map_err(|e| e.to_string())?;
            if let Some(bytes) = bytes {
                return Ok(bytes);
            }
        }
        let state = registered
            .provider
            .current_state()
            .await
            .map_err(|e| e.to_string())?;
        registered
            .marshalling
            .encode_value(&state)
            .map_err(|e| e.to_string())
    }
}
