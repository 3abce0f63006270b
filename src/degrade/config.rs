//! # 配置模块
//!
//! ## 设计思路
//!
//! 将所有“可调策略”集中到 `DegradeConfig`，保证运行时行为可观测、可调整、可测试。
//! 其中降质策略（single / triple）作为高层语义，映射到底层的执行轮数。
//!
//! ## 实现思路
//!
//! - `Default` 提供生产可用配置（单轮降质、默认强度 3）。
//! - `DegradationStrategy` 负责策略字符串解析与反向输出。
//! - `EngineKind` 决定使用内置引擎还是外部 ffmpeg。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::DegradeError;

/// 默认降质强度。
pub const DEFAULT_AMOUNT: u32 = 3;

/// 降质流水线配置。
///
/// 字段覆盖了输入校验、引擎选择、并发与来源加载四个方面。
#[derive(Debug, Clone)]
pub struct DegradeConfig {
    /// 未显式指定时使用的降质强度。
    pub default_amount: u32,
    /// 降质策略。
    pub strategy: DegradationStrategy,
    /// 原始输入允许的最大字节数。
    pub max_input_bytes: u64,
    /// 输入图片像素上限（`width * height`）。
    pub max_input_pixels: u64,
    /// 同时进入引擎的最大调用数，1 表示完全串行。
    pub max_concurrent_runs: usize,
    /// 使用的引擎实现。
    pub engine: EngineKind,
    /// 外部 ffmpeg 可执行文件路径。
    pub ffmpeg_path: PathBuf,
    /// 是否把引擎日志转发到 `log`（开发构建默认开启）。
    pub forward_engine_logs: bool,
    /// 网络下载超时时间（秒）。
    pub download_timeout: u64,
    /// 建立连接超时时间（秒）。
    pub connect_timeout: u64,
    /// 是否允许访问内网或本地地址。
    pub allow_private_network: bool,
}

impl Default for DegradeConfig {
    fn default() -> Self {
        Self {
            default_amount: DEFAULT_AMOUNT,
            strategy: DegradationStrategy::SinglePass,
            max_input_bytes: 50 * 1024 * 1024,
            max_input_pixels: 40_000_000,
            max_concurrent_runs: 2,
            engine: EngineKind::Native,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            forward_engine_logs: cfg!(debug_assertions),
            download_timeout: 30,
            connect_timeout: 8,
            allow_private_network: false,
        }
    }
}

/// 降质策略。
///
/// - `SinglePass`：一次“缩小 → 放大 → 4:2:0”往返（生产默认）
/// - `TriplePass`：连续三轮有损往返，效果更“糊”
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationStrategy {
    #[serde(rename = "single")]
    SinglePass,
    #[serde(rename = "triple")]
    TriplePass,
}

impl DegradationStrategy {
    /// 从外部字符串解析策略。
    ///
    /// # 示例
    /// ```rust
    /// use meme_degrader::degrade::DegradationStrategy;
    ///
    /// let s = DegradationStrategy::from_str("triple")?;
    /// assert_eq!(s.as_str(), "triple");
    /// # Ok::<(), meme_degrader::degrade::DegradeError>(())
    /// ```
    pub fn from_str(strategy: &str) -> Result<Self, DegradeError> {
        match strategy.trim().to_lowercase().as_str() {
            "single" | "single-pass" => Ok(Self::SinglePass),
            "triple" | "triple-pass" => Ok(Self::TriplePass),
            other => Err(DegradeError::InvalidInput(format!(
                "未知降质策略：{}（可选：single / triple）",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SinglePass => "single",
            Self::TriplePass => "triple",
        }
    }

    /// 引擎执行轮数。
    pub fn passes(self) -> usize {
        match self {
            Self::SinglePass => 1,
            Self::TriplePass => 3,
        }
    }
}

/// 引擎实现选择。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Native,
    Ffmpeg,
}

impl EngineKind {
    pub fn from_str(kind: &str) -> Result<Self, DegradeError> {
        match kind.trim().to_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "ffmpeg" => Ok(Self::Ffmpeg),
            other => Err(DegradeError::InvalidInput(format!(
                "未知引擎：{}（可选：native / ffmpeg）",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Ffmpeg => "ffmpeg",
        }
    }
}

impl DegradeConfig {
    /// 校验配置组合是否合法。
    pub fn validate(&self) -> Result<(), DegradeError> {
        if self.default_amount < 1 {
            return Err(DegradeError::InvalidInput("default_amount 不能小于 1".to_string()));
        }
        if self.max_concurrent_runs == 0 {
            return Err(DegradeError::InvalidInput("max_concurrent_runs 不能为 0".to_string()));
        }
        if self.max_input_bytes == 0 || self.max_input_pixels == 0 {
            return Err(DegradeError::InvalidInput("输入上限必须大于 0".to_string()));
        }
        if !(1..=120).contains(&self.connect_timeout) {
            return Err(DegradeError::InvalidInput("connect_timeout 必须在 1~120 秒之间".to_string()));
        }
        if !(1..=600).contains(&self.download_timeout) {
            return Err(DegradeError::InvalidInput("download_timeout 必须在 1~600 秒之间".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_both_spellings() {
        assert_eq!(
            DegradationStrategy::from_str(" Single ").expect("parse single"),
            DegradationStrategy::SinglePass
        );
        assert_eq!(
            DegradationStrategy::from_str("triple-pass").expect("parse triple"),
            DegradationStrategy::TriplePass
        );
        assert!(matches!(
            DegradationStrategy::from_str("quadruple"),
            Err(DegradeError::InvalidInput(_))
        ));
    }

    #[test]
    fn default_config_is_single_pass_amount_three() {
        let config = DegradeConfig::default();
        assert_eq!(config.strategy, DegradationStrategy::SinglePass);
        assert_eq!(config.default_amount, 3);
        assert_eq!(config.strategy.passes(), 1);
        assert_eq!(config.max_concurrent_runs, 2);
        config.validate().expect("default config must be valid");
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = DegradeConfig::default();
        config.max_concurrent_runs = 0;
        assert!(matches!(config.validate(), Err(DegradeError::InvalidInput(_))));
    }
}
