//! 集群组通信
//!
//! 成员视图、组RPC分发（全体成员/协调者/指定节点，同步收集/同步单值/异步发送）、
//! 响应过滤、成员变化通知、状态传输以及基于RPC的集群锁。

pub mod dispatcher;
pub mod filter;
pub mod handler;
pub mod in_memory;
pub mod lock;
pub mod marshalling;
pub mod membership;
pub mod message;
pub mod node;
pub mod service;
pub mod state_transfer;
pub mod transport;
pub mod view;

pub use dispatcher::{CallOptions, GroupRpcDispatcher, InterruptHandle};
pub use filter::{FirstMatchFilter, FirstResponsesFilter, ResponseFilter, ResponseValue};
pub use handler::{RpcHandler, RpcHandlerBuilder};
pub use in_memory::{InMemoryNetwork, InMemoryNetworkConfig, InMemoryTransport};
pub use lock::{ClusterLockManager, LockResult};
pub use marshalling::{JsonCodec, MarshallingContext, PayloadCodec};
pub use membership::{GroupMembershipListener, GroupMembershipNotifier, ViewHistoryEntry};
pub use node::ClusterNode;
pub use service::GroupCommunicationService;
pub use state_transfer::{
    GroupStateTransferService, StateTransferFuture, StateTransferProvider, StateTransferResult,
    StateTransferStatus, STATE_TRANSFER_SERVICE,
};
pub use transport::{GroupTransport, ViewSubscription};
pub use view::{GroupView, MembershipChange};
