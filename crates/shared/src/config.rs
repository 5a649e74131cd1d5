//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Kafka 配置
///
/// `ssl_cert`/`ssl_key` 用于安全 Kafka 连接，本地集群不需要配置。
/// `topics` 是消费端订阅的 topic 白名单。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    pub topics: Vec<String>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "corona-relay".to_string(),
            auto_offset_reset: "latest".to_string(),
            topics: vec![
                "challenge.notification.events".to_string(),
                "submission.notification.create".to_string(),
                "submission.notification.update".to_string(),
                "submission.notification.delete".to_string(),
                "notifications.autopilot.events".to_string(),
            ],
            ssl_cert: None,
            ssl_key: None,
        }
    }
}

/// 外部查询 API 配置
///
/// URL 是带单个占位符的模板字符串，查询时做字面替换。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Auth0 m2m token 交换端点
    pub auth_url: String,
    pub auth_audience: String,
    pub client_id: String,
    pub client_secret: String,
    /// token 过期前的提前刷新余量（秒）
    pub token_leeway_seconds: u64,
    pub challenge_url: String,
    pub user_url: String,
    pub user_by_handle_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            auth_url: "https://auth.topcoder-dev.com/oauth/token".to_string(),
            auth_audience: "https://m2m.topcoder-dev.com/".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            token_leeway_seconds: 60,
            challenge_url: "https://api.topcoder-dev.com/v4/challenges/{challengeId}".to_string(),
            user_url: "https://api.topcoder-dev.com/v3/users?filter=id%3D{memberId}".to_string(),
            user_by_handle_url: "https://api.topcoder-dev.com/v3/members/{handle}".to_string(),
        }
    }
}

/// 下游投递配置
///
/// `mode` 决定归一化事件的去向：重新发布到出站 topic（kafka）、
/// 写入 Redis 有界列表（redis）、或进程内有界队列（memory）。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub mode: String,
    pub outbound_topic: String,
    /// 出站信封中的 originator 字段
    pub originator: String,
    pub list_key: String,
    pub capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            mode: "kafka".to_string(),
            outbound_topic: "corona.notification.events".to_string(),
            originator: "corona-relay".to_string(),
            list_key: "corona:events".to_string(),
            capacity: 100,
        }
    }
}

/// Redis 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// 应用配置
///
/// 所有分组都有默认值，配置文件和环境变量只需提供要覆盖的项。
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub kafka: KafkaConfig,
    pub api: ApiConfig,
    pub sink: SinkConfig,
    pub redis: RedisConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. 环境变量（CORONA_ 前缀，键内层级用双下划线分隔，
    ///    如 CORONA_KAFKA__BROKERS -> kafka.brokers、
    ///    CORONA_API__CLIENT_ID -> api.client_id；
    ///    单下划线保留给 client_id 这类多词字段名本身）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("CORONA_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            // 加载默认配置文件
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            // 加载环境特定配置
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            // 环境变量覆盖（CORONA_KAFKA__BROKERS -> kafka.brokers）
            .add_source(
                Environment::with_prefix("CORONA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
