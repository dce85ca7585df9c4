use serde::{Deserialize, Serialize};

use crate::node::ClusterNode;

/// 组成员视图
///
/// 成员顺序有意义：第一个成员就是协调者。每次成员变化视图编号都严格递增。
///
/// 每个成员还记录它加入时的视图编号，即成员的化身（incarnation）。
/// 同一地址离开后重新加入会得到新的化身编号。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupView {
    view_id: u64,
    members: Vec<ClusterNode>,
    joined_in: Vec<u64>,
}

impl GroupView {
    pub fn new(view_id: u64, members: Vec<ClusterNode>) -> Self {
        let joined_in = vec![view_id; members.len()];
        Self {
            view_id,
            members,
            joined_in,
        }
    }

    /// 基于当前视图生成下一个视图
    ///
    /// 留在组内的成员保留原来的化身编号，新成员的化身就是新视图的编号。
    pub fn successor(&self, members: Vec<ClusterNode>) -> Self {
        let view_id = self.view_id + 1;
        let joined_in = members
            .iter()
            .map(|node| self.incarnation(node).unwrap_or(view_id))
            .collect();
        Self {
            view_id,
            members,
            joined_in,
        }
    }

    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    pub fn members(&self) -> &[ClusterNode] {
        &self.members
    }

    pub fn coordinator(&self) -> Option<&ClusterNode> {
        self.members.first()
    }

    pub fn is_coordinator(&self, node: &ClusterNode) -> bool {
        self.coordinator() == Some(node)
    }

    pub fn contains(&self, node: &ClusterNode) -> bool {
        self.members.contains(node)
    }

    /// 成员加入时的视图编号，不在视图中返回 `None`
    pub fn incarnation(&self, node: &ClusterNode) -> Option<u64> {
        self.members
            .iter()
            .position(|member| member == node)
            .and_then(|index| self.joined_in.get(index).copied())
    }

    /// 成员以给定化身仍在视图中
    pub fn has_incarnation(&self, node: &ClusterNode, incarnation: u64) -> bool {
        self.incarnation(node) == Some(incarnation)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// 上一个视图中存在、本视图中已经消失的成员
    pub fn dead_members(&self, previous: &GroupView) -> Vec<ClusterNode> {
        previous
            .members
            .iter()
            .filter(|node| !self.contains(node))
            .cloned()
            .collect()
    }

    /// 本视图中新加入的成员
    pub fn new_members(&self, previous: &GroupView) -> Vec<ClusterNode> {
        self.members
            .iter()
            .filter(|node| !previous.contains(node))
            .cloned()
            .collect()
    }
}

/// 一次成员变化通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub view_id: u64,
    pub all_members: Vec<ClusterNode>,
    pub dead_members: Vec<ClusterNode>,
    pub new_members: Vec<ClusterNode>,
}

impl MembershipChange {
    pub fn between(previous: &GroupView, current: &GroupView) -> Self {
        Self {
            view_id: current.view_id(),
            all_members: current.members().to_vec(),
            dead_members: current.dead_members(previous),
            new_members: current.new_members(previous),
        }
    }
}
