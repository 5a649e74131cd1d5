//! 统一错误处理模块
//!
//! 定义中继系统共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 错误分类决定了消费端的提交策略：校验/解码类错误丢弃消息后仍提交位点，
//! 远程调用类错误向上传播、不提交位点以触发重投。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum RelayError {
    // ==================== 消息校验错误 ====================
    /// 消息信封不符合校验契约（缺字段、类型不对、payload 非对象等），
    /// 该消息不可恢复，记录日志后丢弃
    #[error("消息校验失败: {0}")]
    Validation(String),

    /// 消息体无法解码为 JSON，视为毒消息，丢弃后仍提交位点避免死循环
    #[error("消息解码失败: {0}")]
    Decode(String),

    // ==================== 外部查询错误 ====================
    /// 查询参数缺失（id/handle 为空），区别于远程返回的错误
    #[error("Missing {field}")]
    MissingId { field: &'static str },

    /// 外部 API 返回非 2xx 状态，携带远程状态码和内容
    #[error("Failed to get {api}: {content}")]
    Remote {
        api: &'static str,
        status: u16,
        content: String,
    },

    /// m2m token 交换失败
    #[error("token 获取失败: {0}")]
    Auth(String),

    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),

    // ==================== 基础设施错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("配置加载失败: {0}")]
    Config(#[from] config::ConfigError),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Decode(_) => "DECODE_ERROR",
            Self::MissingId { .. } => "MISSING_ID",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::Auth(_) => "AUTH_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否应该丢弃消息并提交位点
    ///
    /// 校验/解码错误重投多少次都不会成功，提交位点防止毒消息阻塞分区；
    /// 其余错误不提交，等待 broker 重投。
    pub fn is_discardable(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Decode(_))
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Remote { .. } | Self::Auth(_) | Self::Http(_) | Self::Kafka(_) | Self::Redis(_)
        )
    }
}
