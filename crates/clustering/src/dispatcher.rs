use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use futures::future;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use kernel_core::{ClusterConfig, KernelError, KernelResult};

use crate::filter::{ResponseFilter, ResponseValue};
use crate::handler::{InvocationFailure, RpcHandler};
use crate::marshalling::MarshallingContext;
use crate::message::{Delivery, GroupMessage, ResponseOutcome, RpcRequest, RpcResponse};
use crate::node::ClusterNode;
use crate::transport::GroupTransport;
use crate::view::GroupView;

/// 一次调用的选项
///
/// 默认包含自己、保证同一发送方的有序性、使用分发器配置的超时、不带过滤器。
#[derive(Default)]
pub struct CallOptions {
    exclude_self: bool,
    unordered: bool,
    timeout: Option<Duration>,
    filter: Option<Box<dyn ResponseFilter>>,
    interrupt: Option<watch::Receiver<bool>>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn excluding_self(mut self) -> Self {
        self.exclude_self = true;
        self
    }

    /// 放弃与同一发送方其他调用之间的顺序保证
    pub fn unordered(mut self) -> Self {
        self.unordered = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_filter<F: ResponseFilter + 'static>(mut self, filter: F) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// 让这次调用可以被给定的句柄中断
    pub fn with_interrupt(mut self, handle: &InterruptHandle) -> Self {
        self.interrupt = Some(handle.flag.subscribe());
        self
    }

    pub fn is_exclude_self(&self) -> bool {
        self.exclude_self
    }

    pub fn is_unordered(&self) -> bool {
        self.unordered
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("exclude_self", &self.exclude_self)
            .field("unordered", &self.unordered)
            .field("timeout", &self.timeout)
            .field("has_filter", &self.filter.is_some())
            .field("interruptible", &self.interrupt.is_some())
            .finish()
    }
}

/// 同步调用的中断句柄
///
/// 只影响通过 [`CallOptions::with_interrupt`] 绑定了它的调用，同一分发器上的
/// 其他调用照常等待。中断是一次性的，中断之后再绑定的调用会立即返回。
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<watch::Sender<bool>>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self { flag: Arc::new(flag) }
    }

    pub fn interrupt(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.flag.borrow()
    }
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// 信号变为真时完成；发送端消失则永远不完成
async fn raised(signal: Option<watch::Receiver<bool>>) {
    if let Some(mut signal) = signal {
        if signal.wait_for(|raised| *raised).await.is_ok() {
            return;
        }
    }
    future::pending::<()>().await
}

/// 一次调用收集到的全部结果
#[derive(Debug, Default)]
struct CallResult {
    responses: Vec<(ClusterNode, ResponseValue)>,
    no_handler: Vec<ClusterNode>,
    suspected: Vec<ClusterNode>,
    complete: bool,
}

struct PendingCall {
    service: String,
    method: String,
    /// 尚未响应的目标及其发出请求时的化身
    remaining: HashMap<ClusterNode, Option<u64>>,
    filter: Option<Box<dyn ResponseFilter>>,
    result: CallResult,
    done: oneshot::Sender<CallResult>,
}

impl PendingCall {
    fn is_satisfied(&self) -> bool {
        self.remaining.is_empty()
            || self
                .filter
                .as_ref()
                .is_some_and(|filter| !filter.need_more_responses())
    }

    fn finish(mut self) {
        self.result.complete = true;
        // 调用方已经超时离开时接收端不存在
        let _ = self.done.send(self.result);
    }
}

/// 一次调用已经编码好的请求内容
struct Outbound<'a> {
    service: &'a str,
    method: &'a str,
    signature: &'static str,
    payload: Vec<u8>,
}

impl Outbound<'_> {
    fn request(
        &self,
        request_id: u64,
        sender: &ClusterNode,
        delivery: Delivery,
        expects_reply: bool,
    ) -> RpcRequest {
        RpcRequest {
            request_id,
            sender: sender.clone(),
            service: self.service.to_string(),
            method: self.method.to_string(),
            signature: self.signature.to_string(),
            payload: self.payload.clone(),
            delivery,
            expects_reply,
        }
    }
}

enum Reply {
    Outcome(ResponseOutcome),
    Failed(KernelError),
    Suspected,
}

/// 某个发送方（的一个化身）有序请求的重排缓冲
struct OrderedInbox {
    incarnation: u64,
    next_expected: u64,
    buffer: BTreeMap<u64, RpcRequest>,
    worker: mpsc::UnboundedSender<RpcRequest>,
}

impl OrderedInbox {
    /// 放入一个请求并释放所有已经连续的请求
    ///
    /// 重复的序号不会执行，原样返回给调用方去拒绝。
    fn offer(&mut self, seq: u64, request: RpcRequest) -> Option<RpcRequest> {
        if seq < self.next_expected || self.buffer.contains_key(&seq) {
            warn!(sender = %request.sender, seq, next_expected = self.next_expected, "收到重复的有序请求");
            return Some(request);
        }
        self.buffer.insert(seq, request);
        while let Some(request) = self.buffer.remove(&self.next_expected) {
            if self.worker.send(request).is_err() {
                warn!("有序请求处理任务已经退出");
            }
            self.next_expected += 1;
        }
        None
    }
}

/// 组RPC分发器
///
/// 三种目标（全体成员、协调者、指定节点）共用同一个分发原语。响应按请求编号
/// 归入对应的等待调用；有序请求在接收端按发送方序号重排后串行处理。
#[derive(Clone)]
pub struct GroupRpcDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    transport: Arc<dyn GroupTransport>,
    default_timeout: Duration,
    marshalling: MarshallingContext,
    handlers: RwLock<HashMap<String, Arc<RpcHandler>>>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_request_id: AtomicU64,
    /// 以（目标节点, 目标化身）为键的发送序号
    outbound_seq: Mutex<HashMap<(ClusterNode, u64), u64>>,
    inboxes: Mutex<HashMap<ClusterNode, OrderedInbox>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GroupRpcDispatcher {
    pub async fn start(transport: Arc<dyn GroupTransport>, config: &ClusterConfig) -> Self {
        Self::start_with_marshalling(transport, config, MarshallingContext::default()).await
    }

    pub async fn start_with_marshalling(
        transport: Arc<dyn GroupTransport>,
        config: &ClusterConfig,
        marshalling: MarshallingContext,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(DispatcherInner {
            transport,
            default_timeout: config.method_call_timeout(),
            marshalling,
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            outbound_seq: Mutex::new(HashMap::new()),
            inboxes: Mutex::new(HashMap::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        let receive = tokio::spawn(DispatcherInner::receive_loop(Arc::clone(&inner)));
        let views = tokio::spawn(DispatcherInner::view_loop(Arc::clone(&inner)));
        inner.tasks.lock().await.extend([receive, views]);

        info!(
            node = %inner.transport.local_node(),
            timeout_ms = inner.default_timeout.as_millis() as u64,
            "RPC分发器已启动"
        );
        Self { inner }
    }

    /// 停止接收消息，并中断所有等待中的调用
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.inboxes.lock().await.clear();
        self.inner.pending.lock().await.clear();
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!(node = %self.local_node(), "RPC分发器已停止");
    }

    pub fn local_node(&self) -> &ClusterNode {
        self.inner.transport.local_node()
    }

    pub fn current_view(&self) -> GroupView {
        self.inner.transport.current_view()
    }

    pub fn is_coordinator(&self) -> bool {
        self.inner.transport.is_coordinator()
    }

    pub fn transport(&self) -> &Arc<dyn GroupTransport> {
        &self.inner.transport
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    pub fn marshalling(&self) -> &MarshallingContext {
        &self.inner.marshalling
    }

    /// 为服务名注册处理器，同名处理器已存在时失败
    pub async fn register_handler(&self, handler: Arc<RpcHandler>) -> KernelResult<()> {
        let mut handlers = self.inner.handlers.write().await;
        if handlers.contains_key(handler.service()) {
            return Err(KernelError::DuplicateHandler(handler.service().to_string()));
        }
        debug!(service = handler.service(), methods = ?handler.method_names(), "注册RPC处理器");
        handlers.insert(handler.service().to_string(), handler);
        Ok(())
    }

    /// 注销处理器，只有注册者本人可以注销
    ///
    /// 已经在途的调用不受影响。
    pub async fn unregister_handler(&self, service: &str, handler: &Arc<RpcHandler>) -> KernelResult<()> {
        let mut handlers = self.inner.handlers.write().await;
        match handlers.get(service) {
            None => {
                debug!(service, "服务没有注册处理器，忽略注销");
                Ok(())
            }
            Some(registered) if Arc::ptr_eq(registered, handler) => {
                handlers.remove(service);
                debug!(service, "注销RPC处理器");
                Ok(())
            }
            Some(_) => Err(KernelError::HandlerMismatch(service.to_string())),
        }
    }

    pub async fn has_handler(&self, service: &str) -> bool {
        self.inner.handlers.read().await.contains_key(service)
    }

    /// 调用所有成员，返回被接受的成功结果
    ///
    /// 超时不算错误，返回已经收到的部分结果；失败的响应记录日志后丢弃。
    pub async fn call_method_on_cluster<A, T>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        options: CallOptions,
    ) -> KernelResult<Vec<T>>
    where
        A: Serialize,
        T: DeserializeOwned,
    {
        let responses = self
            .call_method_on_cluster_responses(service, method, args, options)
            .await?;

        let mut results = Vec::with_capacity(responses.len());
        for (node, response) in responses {
            match response {
                ResponseValue::Value(value) => match serde_json::from_value(value) {
                    Ok(value) => results.push(value),
                    Err(e) => debug!(service, method, node = %node, error = %e, "响应类型不匹配"),
                },
                ResponseValue::Failure(e) => {
                    debug!(service, method, node = %node, error = %e, "成员调用失败")
                }
            }
        }
        Ok(results)
    }

    /// 调用所有成员，返回每个被接受响应的原始结果（包括失败）
    pub async fn call_method_on_cluster_responses<A>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        options: CallOptions,
    ) -> KernelResult<Vec<(ClusterNode, ResponseValue)>>
    where
        A: Serialize,
    {
        let targets = self.cluster_targets(options.exclude_self);
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);
        let result = self
            .inner
            .invoke(targets, service, method, args, options)
            .await?;
        if !result.complete {
            counter!("kernel_rpc_timeouts_total", "service" => service.to_string()).increment(1);
            debug!(
                service,
                method,
                timeout_ms = timeout.as_millis() as u64,
                received = result.responses.len(),
                "集群调用超时，返回部分结果"
            );
        }
        Ok(result.responses)
    }

    /// 调用协调者
    ///
    /// 本节点就是协调者并且排除自己时返回 `None`。
    pub async fn call_method_on_coordinator<A, T>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        options: CallOptions,
    ) -> KernelResult<Option<T>>
    where
        A: Serialize,
        T: DeserializeOwned,
    {
        let view = self.current_view();
        let coordinator = view
            .coordinator()
            .ok_or_else(|| KernelError::illegal_state("当前视图没有成员"))?;
        if options.exclude_self && coordinator == self.local_node() {
            return Ok(None);
        }
        self.call_method_on_node(service, method, args, coordinator, options)
            .await
            .map(Some)
    }

    /// 调用指定节点并等待唯一结果，超时是错误
    pub async fn call_method_on_node<A, T>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        node: &ClusterNode,
        options: CallOptions,
    ) -> KernelResult<T>
    where
        A: Serialize,
        T: DeserializeOwned,
    {
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);
        let result = self
            .inner
            .invoke(vec![node.clone()], service, method, args, options)
            .await?;

        if let Some((_, response)) = result.responses.into_iter().next() {
            return match response {
                ResponseValue::Value(value) => serde_json::from_value(value)
                    .map_err(|e| KernelError::marshalling(e.to_string())),
                ResponseValue::Failure(e) => Err(e),
            };
        }
        if !result.no_handler.is_empty() {
            return Err(KernelError::DispatchNoHandler {
                node: node.to_string(),
                service: service.to_string(),
            });
        }
        if !result.suspected.is_empty() {
            return Err(KernelError::unreachable(node.to_string()));
        }
        if !result.complete {
            counter!("kernel_rpc_timeouts_total", "service" => service.to_string()).increment(1);
            return Err(KernelError::timeout(format!(
                "{service}.{method} 在 {timeout:?} 内没有收到 {node} 的响应"
            )));
        }
        Err(KernelError::illegal_state(format!(
            "{node} 对 {service}.{method} 的响应被过滤器拒绝"
        )))
    }

    /// 异步调用所有成员，不等待结果；发送失败只记录日志
    pub async fn call_async_method_on_cluster<A>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        options: CallOptions,
    ) -> KernelResult<()>
    where
        A: Serialize,
    {
        let targets = self.cluster_targets(options.exclude_self);
        self.inner
            .fire(targets, service, method, args, options.unordered)
            .await
    }

    pub async fn call_async_method_on_coordinator<A>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        options: CallOptions,
    ) -> KernelResult<()>
    where
        A: Serialize,
    {
        let view = self.current_view();
        let Some(coordinator) = view.coordinator() else {
            warn!(service, method, "当前视图没有成员，丢弃异步调用");
            return Ok(());
        };
        if options.exclude_self && coordinator == self.local_node() {
            return Ok(());
        }
        self.inner
            .fire(vec![coordinator.clone()], service, method, args, options.unordered)
            .await
    }

    pub async fn call_async_method_on_node<A>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        node: &ClusterNode,
        options: CallOptions,
    ) -> KernelResult<()>
    where
        A: Serialize,
    {
        self.inner
            .fire(vec![node.clone()], service, method, args, options.unordered)
            .await
    }

    fn cluster_targets(&self, exclude_self: bool) -> Vec<ClusterNode> {
        let local = self.local_node();
        self.current_view()
            .members()
            .iter()
            .filter(|node| !(exclude_self && *node == local))
            .cloned()
            .collect()
    }
}

impl DispatcherInner {
    async fn next_delivery(&self, target: &ClusterNode, unordered: bool) -> Delivery {
        if unordered {
            return Delivery::Unordered;
        }
        let view = self.transport.current_view();
        let local = self.transport.local_node();
        let (Some(sender_incarnation), Some(target_incarnation)) =
            (view.incarnation(local), view.incarnation(target))
        else {
            // 任一方不在视图中时无法建立序列，发送本身会失败
            return Delivery::Unordered;
        };
        let mut seqs = self.outbound_seq.lock().await;
        let seq = seqs.entry((target.clone(), target_incarnation)).or_insert(0);
        *seq += 1;
        Delivery::Ordered {
            sender_incarnation,
            target_incarnation,
            seq: *seq,
        }
    }

    async fn invoke<A: Serialize>(
        &self,
        targets: Vec<ClusterNode>,
        service: &str,
        method: &str,
        args: &A,
        mut options: CallOptions,
    ) -> KernelResult<CallResult> {
        let outbound = Outbound {
            service,
            method,
            signature: std::any::type_name::<A>(),
            payload: self.marshalling.to_bytes(args)?,
        };
        counter!("kernel_rpc_calls_total", "service" => service.to_string()).increment(1);

        if targets.is_empty() {
            return Ok(CallResult {
                complete: true,
                ..CallResult::default()
            });
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let interrupt = options.interrupt.take();
        let stopped = self.shutdown.subscribe();
        let (done, mut finished) = oneshot::channel();

        let view = self.transport.current_view();
        self.pending.lock().await.insert(
            request_id,
            PendingCall {
                service: service.to_string(),
                method: method.to_string(),
                remaining: targets
                    .iter()
                    .map(|target| (target.clone(), view.incarnation(target)))
                    .collect(),
                filter: options.filter.take(),
                result: CallResult::default(),
                done,
            },
        );

        trace!(request_id, service, method, targets = targets.len(), "发送RPC请求");
        for target in &targets {
            let delivery = self.next_delivery(target, options.unordered).await;
            let request = outbound.request(request_id, self.transport.local_node(), delivery, true);
            if let Err(e) = self.transport.send(target, GroupMessage::Request(request)).await {
                debug!(request_id, target = %target, error = %e, "发送RPC请求失败");
                self.record_reply(request_id, target, Reply::Failed(e)).await;
            }
        }

        tokio::select! {
            result = &mut finished => result.map_err(|_| KernelError::Interrupted),
            _ = tokio::time::sleep(timeout) => {
                let partial = self.pending.lock().await.remove(&request_id);
                match partial {
                    Some(call) => Ok(call.result),
                    // 超时与完成同时发生
                    None => finished.await.map_err(|_| KernelError::Interrupted),
                }
            }
            _ = raised(interrupt) => {
                self.pending.lock().await.remove(&request_id);
                debug!(request_id, service, method, "等待RPC响应时被中断");
                Err(KernelError::Interrupted)
            }
            _ = raised(Some(stopped)) => {
                debug!(request_id, service, method, "分发器停止，放弃等待RPC响应");
                Err(KernelError::Interrupted)
            }
        }
    }

    async fn fire<A: Serialize>(
        &self,
        targets: Vec<ClusterNode>,
        service: &str,
        method: &str,
        args: &A,
        unordered: bool,
    ) -> KernelResult<()> {
        let outbound = Outbound {
            service,
            method,
            signature: std::any::type_name::<A>(),
            payload: self.marshalling.to_bytes(args)?,
        };
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        counter!("kernel_rpc_calls_total", "service" => service.to_string()).increment(1);

        for target in &targets {
            let delivery = self.next_delivery(target, unordered).await;
            let request = outbound.request(request_id, self.transport.local_node(), delivery, false);
            if let Err(e) = self.transport.send(target, GroupMessage::Request(request)).await {
                warn!(service, method, target = %target, error = %e, "异步RPC调用发送失败");
            }
        }
        Ok(())
    }

    fn interpret(
        call: &PendingCall,
        sender: &ClusterNode,
        outcome: ResponseOutcome,
        marshalling: &MarshallingContext,
    ) -> Option<ResponseValue> {
        let value = match outcome {
            ResponseOutcome::Value(bytes) => match marshalling.decode_value(&bytes) {
                Ok(value) => ResponseValue::Value(value),
                Err(e) => ResponseValue::Failure(e),
            },
            ResponseOutcome::ApplicationError(message) => {
                ResponseValue::Failure(KernelError::RemoteInvocation {
                    node: sender.to_string(),
                    service: call.service.clone(),
                    method: call.method.clone(),
                    message,
                })
            }
            ResponseOutcome::NoHandler => return None,
            ResponseOutcome::NoSuchMethod => ResponseValue::Failure(KernelError::DispatchNoSuchMethod {
                node: sender.to_string(),
                service: call.service.clone(),
                method: call.method.clone(),
            }),
            ResponseOutcome::SignatureMismatch { expected, actual } => {
                ResponseValue::Failure(KernelError::DispatchSignatureMismatch {
                    service: call.service.clone(),
                    method: call.method.clone(),
                    expected,
                    actual,
                })
            }
            ResponseOutcome::Marshalling(message) => {
                ResponseValue::Failure(KernelError::marshalling(format!("{sender}: {message}")))
            }
            ResponseOutcome::Rejected(reason) => ResponseValue::Failure(KernelError::DispatchRejected {
                node: sender.to_string(),
                service: call.service.clone(),
                method: call.method.clone(),
                reason,
            }),
        };
        Some(value)
    }

    async fn record_reply(&self, request_id: u64, sender: &ClusterNode, reply: Reply) {
        let mut pending = self.pending.lock().await;
        let Some(call) = pending.get_mut(&request_id) else {
            trace!(request_id, sender = %sender, "收到已结束调用的响应");
            return;
        };
        if call.remaining.remove(sender).is_none() {
            debug!(request_id, sender = %sender, "忽略非目标成员或重复的响应");
            return;
        }

        let response = match reply {
            Reply::Outcome(outcome) => Self::interpret(call, sender, outcome, &self.marshalling),
            Reply::Failed(e) => Some(ResponseValue::Failure(e)),
            Reply::Suspected => {
                call.result.suspected.push(sender.clone());
                None
            }
        };

        match response {
            // 没有处理器的响应不经过过滤器，但仍然算作已响应
            None => {
                if !call.result.suspected.contains(sender) {
                    call.result.no_handler.push(sender.clone());
                }
            }
            Some(value) => {
                let accepted = match call.filter.as_mut() {
                    Some(filter) => filter.is_acceptable(&value, sender),
                    None => true,
                };
                if accepted {
                    counter!("kernel_rpc_responses_accepted_total").increment(1);
                    call.result.responses.push((sender.clone(), value));
                }
            }
        }

        if call.is_satisfied() {
            if let Some(call) = pending.remove(&request_id) {
                call.finish();
            }
        }
    }

    async fn receive_loop(inner: Arc<DispatcherInner>) {
        let mut shutdown = inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                message = inner.transport.receive() => match message {
                    Some(GroupMessage::Request(request)) => inner.on_request(request).await,
                    Some(GroupMessage::Response(response)) => {
                        let RpcResponse { request_id, sender, outcome } = response;
                        inner
                            .record_reply(request_id, &sender, Reply::Outcome(outcome))
                            .await;
                    }
                    None => {
                        info!(node = %inner.transport.local_node(), "传输层已关闭，停止接收消息");
                        break;
                    }
                },
            }
        }
    }

    /// 视图变化时，把离开的成员视为已响应，并丢弃它们的有序缓冲
    ///
    /// 视图流只用来触发检查，判断依据是最新视图里各成员的化身，
    /// 处理滞后的旧视图不会误伤已经重新加入的成员。
    async fn view_loop(inner: Arc<DispatcherInner>) {
        let mut views = inner.transport.subscribe_views();
        let mut shutdown = inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                view = views.next() => match view {
                    Some(view) => inner.on_view_change(&view).await,
                    None => break,
                },
            }
        }
    }

    async fn on_view_change(&self, installed: &GroupView) {
        let view = self.transport.current_view();
        let departed = |node: &ClusterNode, incarnation: &Option<u64>| match incarnation {
            Some(incarnation) => !view.has_incarnation(node, *incarnation),
            None => !view.contains(node),
        };
        let mut suspects: Vec<(u64, ClusterNode)> = Vec::new();
        {
            let pending = self.pending.lock().await;
            for (request_id, call) in pending.iter() {
                for (node, _) in call
                    .remaining
                    .iter()
                    .filter(|(node, incarnation)| departed(*node, *incarnation))
                {
                    suspects.push((*request_id, node.clone()));
                }
            }
        }
        for (request_id, node) in suspects {
            debug!(request_id, node = %node, view_id = installed.view_id(), "目标成员已离开视图");
            self.record_reply(request_id, &node, Reply::Suspected).await;
        }

        // 离开过的成员即使已经重新加入，化身也变了，旧序列全部作废
        self.inboxes
            .lock()
            .await
            .retain(|node, inbox| view.has_incarnation(node, inbox.incarnation));
        self.outbound_seq
            .lock()
            .await
            .retain(|(node, incarnation), _| view.has_incarnation(node, *incarnation));
    }

    async fn on_request(self: &Arc<Self>, request: RpcRequest) {
        let Delivery::Ordered {
            sender_incarnation,
            target_incarnation,
            seq,
        } = request.delivery
        else {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.handle_request(request).await });
            return;
        };

        let local_incarnation = self
            .transport
            .current_view()
            .incarnation(self.transport.local_node());
        if local_incarnation != Some(target_incarnation) {
            let reason = format!("请求发给了化身 {target_incarnation}，本节点当前化身 {local_incarnation:?}");
            self.reject(request, reason).await;
            return;
        }

        let rejected = {
            let mut inboxes = self.inboxes.lock().await;
            let inbox = inboxes
                .entry(request.sender.clone())
                .or_insert_with(|| self.spawn_inbox(&request.sender, sender_incarnation));
            if inbox.incarnation < sender_incarnation {
                debug!(sender = %request.sender, old = inbox.incarnation, new = sender_incarnation, "发送方重新加入，重置有序序列");
                *inbox = self.spawn_inbox(&request.sender, sender_incarnation);
            }
            if inbox.incarnation > sender_incarnation {
                Some((request, format!("发送方化身 {sender_incarnation} 已经过期")))
            } else {
                inbox
                    .offer(seq, request)
                    .map(|request| (request, format!("序号 {seq} 重复")))
            }
        };
        if let Some((request, reason)) = rejected {
            self.reject(request, reason).await;
        }
    }

    /// 不执行请求；调用方在等待时回复拒绝原因
    async fn reject(&self, request: RpcRequest, reason: String) {
        warn!(
            sender = %request.sender,
            service = %request.service,
            method = %request.method,
            reason = %reason,
            "拒绝有序请求"
        );
        if request.expects_reply {
            self.respond(&request, ResponseOutcome::Rejected(reason)).await;
        }
    }

    fn spawn_inbox(self: &Arc<Self>, sender: &ClusterNode, incarnation: u64) -> OrderedInbox {
        let (worker, mut requests) = mpsc::unbounded_channel::<RpcRequest>();
        let inner = Arc::clone(self);
        let sender = sender.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                inner.handle_request(request).await;
            }
            trace!(sender = %sender, "有序请求处理任务退出");
        });
        OrderedInbox {
            incarnation,
            next_expected: 1,
            buffer: BTreeMap::new(),
            worker,
        }
    }

    async fn handle_request(&self, request: RpcRequest) {
        let outcome = self.invoke_local(&request).await;
        if !request.expects_reply {
            if !matches!(outcome, ResponseOutcome::Value(_)) {
                debug!(
                    service = %request.service,
                    method = %request.method,
                    sender = %request.sender,
                    outcome = ?outcome,
                    "异步RPC调用未成功"
                );
            }
            return;
        }

        self.respond(&request, outcome).await;
    }

    async fn respond(&self, request: &RpcRequest, outcome: ResponseOutcome) {
        let response = GroupMessage::Response(RpcResponse {
            request_id: request.request_id,
            sender: self.transport.local_node().clone(),
            outcome,
        });
        if let Err(e) = self.transport.send(&request.sender, response).await {
            warn!(to = %request.sender, request_id = request.request_id, error = %e, "发送RPC响应失败");
        }
    }

    async fn invoke_local(&self, request: &RpcRequest) -> ResponseOutcome {
        let handler = self.handlers.read().await.get(&request.service).cloned();
        let Some(handler) = handler else {
            trace!(service = %request.service, "没有对应的RPC处理器");
            return ResponseOutcome::NoHandler;
        };
        let Some(method) = handler.method(&request.method) else {
            return ResponseOutcome::NoSuchMethod;
        };
        if method.signature != request.signature {
            return ResponseOutcome::SignatureMismatch {
                expected: method.signature.to_string(),
                actual: request.signature.clone(),
            };
        }

        let args = match handler.marshalling().decode_value(&request.payload) {
            Ok(args) => args,
            Err(e) => return ResponseOutcome::Marshalling(e.to_string()),
        };
        let invoke = Arc::clone(&method.invoke);
        match invoke(args).await {
            Ok(value) => match handler.marshalling().encode_value(&value) {
                Ok(bytes) => ResponseOutcome::Value(bytes),
                Err(e) => ResponseOutcome::Marshalling(e.to_string()),
            },
            Err(InvocationFailure::Application(message)) => ResponseOutcome::ApplicationError(message),
            Err(InvocationFailure::Marshalling(message)) => ResponseOutcome::Marshalling(message),
        }
    }
}
