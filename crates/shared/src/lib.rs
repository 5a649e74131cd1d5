//! 共享库
//!
//! 包含中继服务共用的配置、错误处理、事件模型、缓存、Kafka 等基础设施代码。

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
