//! 通知中继服务
//!
//! 消费入站 Kafka 事件，分类、补全后写入出站 sink。

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use corona_shared::cache::Cache;
use corona_shared::config::AppConfig;
use corona_shared::kafka::KafkaProducer;
use corona_shared::observability;

use corona_relay::api_client::LookupClient;
use corona_relay::classifier::Classifier;
use corona_relay::consumer::RelayConsumer;
use corona_relay::error::WorkerError;
use corona_relay::sink::{EventSink, KafkaRepublishSink, MemorySink, RedisListSink};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 统一加载配置：config/default.toml + config/{env}.toml + CORONA_ 环境变量
    let config = AppConfig::load("corona-relay").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {e}");
        AppConfig::default()
    });

    // 2. 初始化日志
    observability::init(&config.observability)?;

    info!("Starting corona-relay...");
    info!(environment = %config.environment, "Configuration loaded");

    // 3. 按配置选择出站 sink
    let sink: Arc<dyn EventSink> = match config.sink.mode.as_str() {
        "kafka" => {
            let producer = KafkaProducer::new(&config.kafka)?;
            info!(topic = %config.sink.outbound_topic, "Kafka republish sink initialized");
            Arc::new(KafkaRepublishSink::new(producer, &config.sink))
        }
        "redis" => {
            let cache = Cache::new(&config.redis)?;
            cache.health_check().await?;
            info!(
                key = %config.sink.list_key,
                capacity = config.sink.capacity,
                "Redis list sink initialized"
            );
            Arc::new(RedisListSink::new(cache, &config.sink))
        }
        "memory" => {
            info!(capacity = config.sink.capacity, "In-memory sink initialized");
            Arc::new(MemorySink::new(config.sink.capacity))
        }
        other => return Err(WorkerError::UnknownSinkMode(other.to_string()).into()),
    };

    // 4. 查询客户端与分类器
    let api = Arc::new(LookupClient::new(config.api.clone()));
    let classifier = Arc::new(Classifier::new(api, sink));
    info!("Lookup client and classifier initialized");

    // 5. 优雅关闭信号
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // 6. 进入消费循环
    let consumer = RelayConsumer::new(&config.kafka, classifier)?;
    consumer.run(shutdown_rx).await?;

    info!("Service shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
///
/// 监听 Ctrl+C 和 SIGTERM 信号，用于 Kubernetes 优雅关闭
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
