//! 下游投递
//!
//! `EventSink` 抽象归一化事件的去向，三种实现按配置选择：
//! 重新发布到出站 Kafka topic、写入 Redis 有界列表、
//! 或进程内有界队列（供推送通道和测试消费）。
//! 有界变体的追加与裁剪是单个原子步骤，容量上限严格生效。

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info};

use corona_shared::cache::Cache;
use corona_shared::config::SinkConfig;
use corona_shared::error::Result;
use corona_shared::events::NormalizedEvent;
use corona_shared::kafka::KafkaProducer;

/// 归一化事件的下游投递接口
#[async_trait]
pub trait EventSink: Send + Sync {
    /// 投递一条归一化事件记录
    async fn deliver(&self, event: &NormalizedEvent) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemorySink — 进程内有界队列
// ---------------------------------------------------------------------------

/// 进程内有界 FIFO 队列
///
/// 追加到尾部后若超出容量则弹出一个头部（最旧）元素，
/// 两步在同一把锁内完成，队列长度不会瞬时超过容量。
pub struct MemorySink {
    capacity: usize,
    entries: Mutex<VecDeque<NormalizedEvent>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// 按插入顺序复制当前全部条目
    pub fn snapshot(&self) -> Vec<NormalizedEvent> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn deliver(&self, event: &NormalizedEvent) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.push_back(event.clone());
        if entries.len() > self.capacity {
            entries.pop_front();
        }
        debug!(
            message_type = %event.message_type,
            len = entries.len(),
            "事件已写入内存队列"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RedisListSink — Redis 有界列表
// ---------------------------------------------------------------------------

/// Redis 有界列表投递
///
/// 固定 key 下 RPUSH + LTRIM 原子执行，持久化变体供推送通道消费。
pub struct RedisListSink {
    cache: Cache,
    key: String,
    capacity: usize,
}

impl RedisListSink {
    pub fn new(cache: Cache, config: &SinkConfig) -> Self {
        Self {
            cache,
            key: config.list_key.clone(),
            capacity: config.capacity,
        }
    }
}

#[async_trait]
impl EventSink for RedisListSink {
    async fn deliver(&self, event: &NormalizedEvent) -> Result<()> {
        self.cache
            .push_capped(&self.key, event, self.capacity)
            .await?;
        debug!(key = %self.key, message_type = %event.message_type, "事件已写入 Redis 列表");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KafkaRepublishSink — 出站 topic 重新发布
// ---------------------------------------------------------------------------

/// 出站 Kafka 重新发布
///
/// 把归一化事件作为 payload 包进标准信封后发布到出站 topic。
pub struct KafkaRepublishSink {
    producer: KafkaProducer,
    topic: String,
    originator: String,
}

impl KafkaRepublishSink {
    pub fn new(producer: KafkaProducer, config: &SinkConfig) -> Self {
        Self {
            producer,
            topic: config.outbound_topic.clone(),
            originator: config.originator.clone(),
        }
    }
}

#[async_trait]
impl EventSink for KafkaRepublishSink {
    async fn deliver(&self, event: &NormalizedEvent) -> Result<()> {
        let envelope = json!({
            "topic": self.topic,
            "originator": self.originator,
            "timestamp": Utc::now().to_rfc3339(),
            "mime-type": "application/json",
            "payload": event,
        });

        let key = event
            .challenge_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| event.message_type.clone());

        self.producer.send_json(&self.topic, &key, &envelope).await?;

        info!(topic = %self.topic, key, "归一化事件已重新发布");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
