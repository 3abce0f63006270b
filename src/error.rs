//! 统一错误类型模块
//!
//! # 设计思路
//!
//! 定义应用级 `AppError` 枚举，承接降质流水线、设置文件与结果落盘三类错误，
//! 替代分散的 `.map_err(|e| e.to_string())`、`expect()` 等不一致模式。
//!
//! # 实现思路
//!
//! - 使用 `thiserror` 派生可读错误消息。
//! - 为 `DegradeError` 与 `std::io::Error` 提供 `From` 转换，无需手动 map。
//! - 实现 `Serialize` 将错误序列化为字符串，便于 `--json` 输出。

use serde::Serialize;

use crate::degrade::DegradeError;

/// 应用级统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 降质流水线错误（加载 / 引擎 / 处理）
    #[error("{0}")]
    Degrade(#[from] DegradeError),

    /// 文件系统 I/O 错误
    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),

    /// 输出目录不可用
    #[error("存储目录不可用: {0}")]
    Storage(String),

    /// 设置文件读取或解析失败
    #[error("设置文件错误: {0}")]
    Settings(String),
}

impl AppError {
    /// 进程退出码：输入类错误 2，其余 1。
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Degrade(DegradeError::InvalidInput(_)) | Self::Settings(_) => 2,
            _ => 1,
        }
    }
}

/// 将错误序列化为人类可读的字符串。
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
