use std::sync::Arc;

use tracing::info;

use kernel_core::{ClusterConfig, KernelResult};

use crate::dispatcher::GroupRpcDispatcher;
use crate::membership::GroupMembershipNotifier;
use crate::node::ClusterNode;
use crate::state_transfer::GroupStateTransferService;
use crate::transport::GroupTransport;
use crate::view::GroupView;

/// 组通信服务
///
/// 把RPC分发、成员通知和状态传输组合在同一个传输端点上。
pub struct GroupCommunicationService {
    group_name: String,
    transport: Arc<dyn GroupTransport>,
    dispatcher: GroupRpcDispatcher,
    membership: GroupMembershipNotifier,
    state_transfer: GroupStateTransferService,
}

impl GroupCommunicationService {
    pub async fn start(transport: Arc<dyn GroupTransport>, config: &ClusterConfig) -> KernelResult<Self> {
        let dispatcher = GroupRpcDispatcher::start(Arc::clone(&transport), config).await;
        let membership = GroupMembershipNotifier::start(&transport, config).await;
        let state_transfer = GroupStateTransferService::start(dispatcher.clone(), config).await?;

        let view = transport.current_view();
        info!(
            group = %config.group_name,
            node = %transport.local_node(),
            view_id = view.view_id(),
            coordinator = transport.is_coordinator(),
            "组通信服务已启动"
        );
        Ok(Self {
            group_name: config.group_name.clone(),
            transport,
            dispatcher,
            membership,
            state_transfer,
        })
    }

    pub async fn stop(&self) -> KernelResult<()> {
        self.state_transfer.stop().await?;
        self.membership.stop().await;
        self.dispatcher.stop().await;
        info!(group = %self.group_name, node = %self.local_node(), "组通信服务已停止");
        Ok(())
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn local_node(&self) -> &ClusterNode {
        self.transport.local_node()
    }

    pub fn current_view(&self) -> GroupView {
        self.transport.current_view()
    }

    pub fn current_view_id(&self) -> u64 {
        self.transport.current_view().view_id()
    }

    pub fn is_coordinator(&self) -> bool {
        self.transport.is_coordinator()
    }

    pub fn dispatcher(&self) -> &GroupRpcDispatcher {
        &self.dispatcher
    }

    pub fn membership(&self) -> &GroupMembershipNotifier {
        &self.membership
    }

    pub fn state_transfer(&self) -> &GroupStateTransferService {
        &self.state_transfer
    }
}
