//! 中继服务专用错误类型
//!
//! 在共享库 RelayError 基础上定义本服务特有的错误变体，
//! 主要覆盖启动阶段的配置问题；消息处理路径上的错误
//! 全部走共享错误分类以保持提交策略一致。

use corona_shared::error::RelayError;

/// 中继服务错误
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// sink.mode 配置了未知的投递模式
    #[error("不支持的投递模式: {0}")]
    UnknownSinkMode(String),

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] RelayError),
}
