//! 入站 Kafka 消费循环
//!
//! 把传输层细节收敛在这里：取消息、解码、信封校验、topic 一致性检查，
//! 通过后移交分类器。提交策略依赖共享层的手动提交消费者：
//! handler 返回 Ok 才提交 offset，返回 Err 则 offset 保持未提交，
//! 进程重启后消息会被重新投递。

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use corona_shared::config::KafkaConfig;
use corona_shared::error::{RelayError, Result};
use corona_shared::events::Envelope;
use corona_shared::kafka::{ConsumerMessage, KafkaConsumer};

use crate::classifier::Classifier;

/// 中继消费者：订阅入站 topic 集合，逐条移交分类器
pub struct RelayConsumer {
    consumer: KafkaConsumer,
    classifier: Arc<Classifier>,
    topics: Vec<String>,
}

impl RelayConsumer {
    pub fn new(config: &KafkaConfig, classifier: Arc<Classifier>) -> Result<Self> {
        let consumer = KafkaConsumer::new(config)?;
        Ok(Self {
            consumer,
            classifier,
            topics: config.topics.clone(),
        })
    }

    /// 订阅并进入消费循环，直到 shutdown 信号到来
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;

        let classifier = self.classifier;
        self.consumer
            .start(shutdown, move |msg| {
                let classifier = classifier.clone();
                async move { handle_message(&classifier, &msg).await }
            })
            .await;

        info!("消费循环已退出");
        Ok(())
    }
}

/// 处理一条原始消息
///
/// 丢弃还是传播由错误分类决定：可丢弃错误（解码失败、信封校验失败、
/// topic 不一致）记录后返回 Ok——offset 照常提交，坏消息不会卡住分区；
/// 其余错误（补全/投递失败）返回 Err，offset 不提交。
pub async fn handle_message(classifier: &Classifier, msg: &ConsumerMessage) -> Result<()> {
    match process(classifier, msg).await {
        Ok(true) => {
            info!(topic = %msg.topic, offset = msg.offset, "消息处理完成");
            Ok(())
        }
        Ok(false) => Ok(()),
        Err(e) if e.is_discardable() => {
            warn!(
                topic = %msg.topic,
                offset = msg.offset,
                error = %e,
                code = e.code(),
                "消息不可恢复，已丢弃"
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// 解码、校验并分类一条消息，返回是否被识别处理
async fn process(classifier: &Classifier, msg: &ConsumerMessage) -> Result<bool> {
    let value: serde_json::Value = msg.deserialize_payload()?;
    let envelope = Envelope::from_value(&value)?;

    // 信封声明的 topic 必须与实际消费到的 topic 一致
    if envelope.topic != msg.topic {
        return Err(RelayError::Validation(format!(
            "信封 topic {} 与消费 topic {} 不一致",
            envelope.topic, msg.topic
        )));
    }

    classifier.classify(&envelope).await
}
