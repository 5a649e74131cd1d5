//! 通知中继服务
//!
//! 从 Kafka 消费事件消息，按 topic 和 payload 形状分类，
//! 调用外部 HTTP API（挑战/用户查询）补全匹配到的事件，
//! 再把归一化的事件记录投递到下游（出站 topic 或有界事件缓存）。

pub mod api_client;
pub mod classifier;
pub mod consumer;
pub mod error;
pub mod sink;
