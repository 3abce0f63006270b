//! # 错误模型模块
//!
//! ## 设计思路
//!
//! 使用单一错误枚举承载“输入 → 引擎 → 处理 → 清理”链路中的所有错误来源，
//! 避免字符串拼接式错误处理。通过 `thiserror` 保持人类可读错误，同时让调用侧可按分支匹配。
//!
//! ## 实现思路
//!
//! - `code()` 输出稳定错误码，供命令层序列化给前端或 CLI。
//! - `stage()` 标注出错阶段，便于日志聚合。
//! - `is_retryable()` 区分“稍后重试即可”（引擎未就绪、网络抖动）与终态错误。

use super::engine::EngineError;

/// 降质流水线统一错误类型。
///
/// 该类型会在应用层被上转为 `AppError`，最终透传给调用方。
#[derive(Debug, thiserror::Error)]
pub enum DegradeError {
    #[error("输入无效：{0}")]
    InvalidInput(String),

    #[error("图像引擎尚未就绪：{0}")]
    EngineNotReady(String),

    #[error("处理失败：{0}")]
    ProcessingFailed(String),

    /// 仅用于日志，流水线不会把它返回给调用方。
    #[error("清理虚拟文件失败：{0}")]
    CleanupFailed(String),

    #[error("网络错误：{0}")]
    Network(String),

    #[error("超时错误：{0}")]
    Timeout(String),

    #[error("文件错误：{0}")]
    FileSystem(String),

    #[error("剪贴板错误：{0}")]
    Clipboard(String),

    #[error("资源限制：{0}")]
    ResourceLimit(String),

    #[error("已取消：{0}")]
    Cancelled(String),
}

impl DegradeError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "E_INVALID_INPUT",
            Self::EngineNotReady(_) => "E_ENGINE_NOT_READY",
            Self::ProcessingFailed(_) => "E_PROCESSING_FAILED",
            Self::CleanupFailed(_) => "E_CLEANUP_FAILED",
            Self::Network(_) => "E_NETWORK",
            Self::Timeout(_) => "E_TIMEOUT",
            Self::FileSystem(_) => "E_FILE_SYSTEM",
            Self::Clipboard(_) => "E_CLIPBOARD",
            Self::ResourceLimit(_) => "E_RESOURCE_LIMIT",
            Self::Cancelled(_) => "E_CANCELLED",
        }
    }

    /// 出错阶段。
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) | Self::ResourceLimit(_) => "input",
            Self::Network(_)
            | Self::Timeout(_)
            | Self::FileSystem(_)
            | Self::Clipboard(_)
            | Self::Cancelled(_) => "load",
            Self::EngineNotReady(_) => "engine",
            Self::ProcessingFailed(_) => "process",
            Self::CleanupFailed(_) => "cleanup",
        }
    }

    /// 是否值得由调用方提示用户重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EngineNotReady(_) | Self::Network(_) | Self::Timeout(_)
        )
    }
}

impl From<EngineError> for DegradeError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::NotLoaded | EngineError::Released => Self::EngineNotReady(error.to_string()),
            EngineError::InvalidName(_) => Self::InvalidInput(error.to_string()),
            other => Self::ProcessingFailed(other.to_string()),
        }
    }
}

impl From<DegradeError> for String {
    /// 兼容部分仍使用字符串错误的调用点。
    fn from(error: DegradeError) -> Self {
        error.to_string()
    }
}
