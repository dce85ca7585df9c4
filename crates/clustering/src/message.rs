use serde::{Deserialize, Serialize};

use crate::node::ClusterNode;

/// 请求的顺序要求
///
/// `Ordered` 携带发送方到接收方方向上的序号，序号从1开始连续递增。
/// 序号只在双方各自的一个化身之内有效，任何一方重新加入组后都从1重新开始。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    Ordered {
        /// 发送方加入组时的视图编号
        sender_incarnation: u64,
        /// 发送方认为的接收方化身
        target_incarnation: u64,
        seq: u64,
    },
    Unordered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub request_id: u64,
    pub sender: ClusterNode,
    pub service: String,
    pub method: String,
    /// 参数类型的标识，接收方据此校验签名
    pub signature: String,
    pub payload: Vec<u8>,
    pub delivery: Delivery,
    pub expects_reply: bool,
}

/// 接收方对一次请求的处理结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseOutcome {
    Value(Vec<u8>),
    /// 目标方法自身返回的业务错误
    ApplicationError(String),
    NoHandler,
    NoSuchMethod,
    SignatureMismatch { expected: String, actual: String },
    /// 接收方无法解码参数或编码结果
    Marshalling(String),
    /// 有序请求不属于当前序列（重复或发给了旧化身），没有执行
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub request_id: u64,
    pub sender: ClusterNode,
    pub outcome: ResponseOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMessage {
    Request(RpcRequest),
    Response(RpcResponse),
}

impl GroupMessage {
    pub fn sender(&self) -> &ClusterNode {
        match self {
            GroupMessage::Request(req) => &req.sender,
            GroupMessage::Response(rsp) => &rsp.sender,
        }
    }
}
