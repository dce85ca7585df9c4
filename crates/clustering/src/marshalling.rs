use std::fmt;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use kernel_core::{KernelError, KernelResult};

/// 负载编解码器
///
/// 只处理 `serde_json::Value` 与字节之间的转换，类型化的转换由 [`MarshallingContext`] 完成。
pub trait PayloadCodec: Send + Sync {
    fn name(&self) -> &str;

    fn encode_value(&self, value: &Value) -> KernelResult<Vec<u8>>;

    fn decode_value(&self, bytes: &[u8]) -> KernelResult<Value>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn encode_value(&self, value: &Value) -> KernelResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| KernelError::marshalling(e.to_string()))
    }

    fn decode_value(&self, bytes: &[u8]) -> KernelResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| KernelError::marshalling(e.to_string()))
    }
}

/// 编解码上下文
///
/// 每个RPC处理器、每次状态传输都可以携带自己的上下文，反序列化时显式使用它。
#[derive(Clone)]
pub struct MarshallingContext {
    codec: Arc<dyn PayloadCodec>,
}

impl MarshallingContext {
    pub fn new(codec: Arc<dyn PayloadCodec>) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &Arc<dyn PayloadCodec> {
        &self.codec
    }

    pub fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> KernelResult<Vec<u8>> {
        let value = serde_json::to_value(value).map_err(|e| KernelError::marshalling(e.to_string()))?;
        self.codec.encode_value(&value)
    }

    pub fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> KernelResult<T> {
        let value = self.codec.decode_value(bytes)?;
        serde_json::from_value(value).map_err(|e| KernelError::marshalling(e.to_string()))
    }

    pub fn encode_value(&self, value: &Value) -> KernelResult<Vec<u8>> {
        self.codec.encode_value(value)
    }

    pub fn decode_value(&self, bytes: &[u8]) -> KernelResult<Value> {
        self.codec.decode_value(bytes)
    }
}

impl Default for MarshallingContext {
    fn default() -> Self {
        Self::new(Arc::new(JsonCodec))
    }
}

impl fmt::Debug for MarshallingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarshallingContext")
            .field("codec", &self.codec.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct SessionState {
        id: String,
        hits: u32,
    }

    #[test]
    fn test_typed_round_trip_through_codec() {
        let ctx = MarshallingContext::default();
        let state = SessionState {
            id: "abc".into(),
            hits: 3,
        };
        let bytes = ctx.to_bytes(&state).unwrap();
        let back: SessionState = ctx.from_bytes(&bytes).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_decode_failure_is_marshalling_error() {
        let ctx = MarshallingContext::default();
        let err = ctx.from_bytes::<SessionState>(b"{\"id\": 1}").unwrap_err();
        assert!(matches!(err, KernelError::DispatchMarshalling(_)));
        assert!(err.is_dispatch_failure());
    }
}
