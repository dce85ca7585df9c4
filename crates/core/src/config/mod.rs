//! 内核配置
//!
//! 配置按以下顺序合并：内置默认值、TOML配置文件、`KERNEL_` 前缀的环境变量。
//! 嵌套字段在环境变量中使用 `__` 分隔，例如 `KERNEL_CLUSTER__METHOD_CALL_TIMEOUT_MS=500`。

pub mod models;

pub use models::*;
