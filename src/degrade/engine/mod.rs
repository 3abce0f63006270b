//! # 图像引擎抽象
//!
//! ## 设计思路
//!
//! 流水线不关心像素如何被处理，只依赖一个“类 ffmpeg”的能力接口：
//! 加载、写虚拟文件、按参数列表执行、读回结果、删除文件，以及可选的日志订阅。
//! 这样内置引擎（纯 Rust）与外部 ffmpeg 可以互换，测试也可以注入替身实现。
//!
//! ## 实现思路
//!
//! - `Engine` 使用 `async_trait`，每个操作都是一个挂起点。
//! - 虚拟文件名统一校验，禁止路径分隔符与 `..`，避免逃逸出私有命名空间。
//! - 日志通过 `tokio::sync::broadcast` 分发，订阅方掉队时只丢日志不阻塞引擎。

mod ffmpeg;
mod native;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::broadcast;

pub use ffmpeg::FfmpegEngine;
pub use native::NativeEngine;

/// 日志通道容量。
pub(crate) const LOG_CHANNEL_CAPACITY: usize = 256;

static VIRTUAL_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid virtual file name regex")
});

/// 引擎层错误。
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("引擎尚未加载")]
    NotLoaded,

    #[error("引擎实例已释放")]
    Released,

    #[error("引擎加载失败：{0}")]
    LoadFailed(String),

    #[error("虚拟文件不存在：{0}")]
    FileNotFound(String),

    #[error("非法虚拟文件名：{0}")]
    InvalidName(String),

    #[error("参数无效：{0}")]
    InvalidArgs(String),

    #[error("执行失败：{0}")]
    Exec(String),

    #[error("引擎 I/O 错误：{0}")]
    Io(#[from] std::io::Error),
}

/// 引擎日志级别。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineLogLevel {
    Info,
    Warn,
    Error,
}

/// 引擎吐出的一行诊断日志。
#[derive(Debug, Clone)]
pub struct EngineLogEvent {
    pub level: EngineLogLevel,
    pub message: String,
}

impl EngineLogEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: EngineLogLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: EngineLogLevel::Error,
            message: message.into(),
        }
    }
}

/// 外部图像引擎能力。
///
/// `exec` 接受与 ffmpeg 等价的扁平参数列表：
/// `-i <input> -vf <filter chain> -q:v <quality> <output>`，返回退出码。
/// 是否产出结果由调用方读回输出文件来判断。
#[async_trait]
pub trait Engine: Send + Sync {
    /// 引擎名（用于日志）。
    fn name(&self) -> &'static str;

    async fn load(&self) -> Result<(), EngineError>;

    async fn write_file(&self, name: &str, bytes: Bytes) -> Result<(), EngineError>;

    async fn exec(&self, argv: &[String]) -> Result<i32, EngineError>;

    async fn read_file(&self, name: &str) -> Result<Bytes, EngineError>;

    async fn delete_file(&self, name: &str) -> Result<(), EngineError>;

    /// 当前虚拟文件系统中的文件名（排序后返回）。
    async fn list_files(&self) -> Result<Vec<String>, EngineError>;

    fn subscribe_logs(&self) -> broadcast::Receiver<EngineLogEvent>;
}

/// 校验虚拟文件名。
pub fn validate_virtual_name(name: &str) -> Result<(), EngineError> {
    if name.contains("..") || !VIRTUAL_NAME.is_match(name) {
        return Err(EngineError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_names_reject_path_escapes() {
        assert!(validate_virtual_name("1700000000000-FILE-abcDEF1234.png").is_ok());
        assert!(validate_virtual_name("input.png").is_ok());
        assert!(validate_virtual_name("../etc/passwd").is_err());
        assert!(validate_virtual_name("a/b.png").is_err());
        assert!(validate_virtual_name(".hidden").is_err());
        assert!(validate_virtual_name("").is_err());
        assert!(validate_virtual_name("a..png").is_err());
    }
}
