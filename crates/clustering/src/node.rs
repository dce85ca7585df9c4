use std::fmt;

use serde::{Deserialize, Serialize};

/// 通信组中的一个成员
///
/// 跨进程比较时只看名称、地址和端口，排序也按这个顺序。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterNode {
    name: String,
    address: String,
    port: u16,
}

impl ClusterNode {
    pub fn new<N: Into<String>, A: Into<String>>(name: N, address: A, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` 形式的地址
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}:{})", self.name, self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_identity_survives_serialization() {
        let node = ClusterNode::new("node-1", "10.0.0.1", 7600);
        let json = serde_json::to_string(&node).unwrap();
        let back: ClusterNode = serde_json::from_str(&json).unwrap();
        assert_eq!(node, back);
        assert_eq!(back.host_port(), "10.0.0.1:7600");
        assert_eq!(back.to_string(), "node-1(10.0.0.1:7600)");
    }

    #[test]
    fn test_node_ordering() {
        let a = ClusterNode::new("a", "10.0.0.2", 7600);
        let b = ClusterNode::new("b", "10.0.0.1", 7600);
        let a2 = ClusterNode::new("a", "10.0.0.2", 7601);
        assert!(a < b);
        assert!(a < a2);
    }
}
