use serde_json::Value;

use kernel_core::KernelError;

use crate::node::ClusterNode;

/// 单个成员的响应
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseValue {
    Value(Value),
    Failure(KernelError),
}

impl ResponseValue {
    pub fn is_failure(&self) -> bool {
        matches!(self, ResponseValue::Failure(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            ResponseValue::Value(v) => Some(v),
            ResponseValue::Failure(_) => None,
        }
    }
}

/// 响应过滤器
///
/// 每次调用创建一个，不能在并发调用之间复用。每收到一个响应先调用
/// `is_acceptable`，随后调用 `need_more_responses`；后者返回 `false` 时调用立即结束。
pub trait ResponseFilter: Send {
    fn is_acceptable(&mut self, response: &ResponseValue, sender: &ClusterNode) -> bool;

    fn need_more_responses(&self) -> bool;
}

/// 接受前 N 个成功响应后停止等待
#[derive(Debug)]
pub struct FirstResponsesFilter {
    wanted: usize,
    accepted: usize,
}

impl FirstResponsesFilter {
    pub fn new(wanted: usize) -> Self {
        Self {
            wanted,
            accepted: 0,
        }
    }
}

impl ResponseFilter for FirstResponsesFilter {
    fn is_acceptable(&mut self, response: &ResponseValue, _sender: &ClusterNode) -> bool {
        if response.is_failure() || self.accepted >= self.wanted {
            return false;
        }
        self.accepted += 1;
        true
    }

    fn need_more_responses(&self) -> bool {
        self.accepted < self.wanted
    }
}

/// 接受满足条件的第一个响应
pub struct FirstMatchFilter<F> {
    predicate: F,
    matched: bool,
}

impl<F> FirstMatchFilter<F>
where
    F: FnMut(&Value) -> bool + Send,
{
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            matched: false,
        }
    }
}

impl<F> ResponseFilter for FirstMatchFilter<F>
where
    F: FnMut(&Value) -> bool + Send,
{
    fn is_acceptable(&mut self, response: &ResponseValue, _sender: &ClusterNode) -> bool {
        if self.matched {
            return false;
        }
        self.matched = response.value().is_some_and(|v| (self.predicate)(v));
        self.matched
    }

    fn need_more_responses(&self) -> bool {
        !self.matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(name: &str) -> ClusterNode {
        ClusterNode::new(name, "127.0.0.1", 7600)
    }

    #[test]
    fn test_first_responses_filter() {
        let mut filter = FirstResponsesFilter::new(2);
        let failure = ResponseValue::Failure(KernelError::unreachable("x"));

        assert!(!filter.is_acceptable(&failure, &node("x")));
        assert!(filter.need_more_responses());
        assert!(filter.is_acceptable(&ResponseValue::Value(json!(1)), &node("a")));
        assert!(filter.is_acceptable(&ResponseValue::Value(json!(2)), &node("b")));
        assert!(!filter.need_more_responses());
        assert!(!filter.is_acceptable(&ResponseValue::Value(json!(3)), &node("c")));
    }

    #[test]
    fn test_first_match_filter() {
        let mut filter = FirstMatchFilter::new(|v: &Value| v.as_bool() == Some(true));
        assert!(!filter.is_acceptable(&ResponseValue::Value(json!(false)), &node("a")));
        assert!(filter.need_more_responses());
        assert!(filter.is_acceptable(&ResponseValue::Value(json!(true)), &node("b")));
        assert!(!filter.need_more_responses());
    }
}
