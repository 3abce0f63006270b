//! 设置文件模块
//!
//! # 设计思路
//!
//! 设置文件是一个可选的 JSON 对象，只覆盖用户显式写出的字段，
//! 其余字段保持 `DegradeConfig::default()` 的生产默认值。
//!
//! # 实现思路
//!
//! - 路径优先取命令行 `--config`，其次取环境变量 `MEME_DEGRADER_CONFIG`。
//! - 所有字段都是 `Option`，借助 `serde(default)` 容忍缺省。
//! - 覆盖完成后统一走 `DegradeConfig::validate()`。

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::degrade::{DegradationStrategy, DegradeConfig, EngineKind};
use crate::error::AppError;

/// 设置文件路径环境变量。
pub const CONFIG_ENV_VAR: &str = "MEME_DEGRADER_CONFIG";

/// 设置文件内容。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppSettings {
    pub default_amount: Option<u32>,
    pub strategy: Option<DegradationStrategy>,
    pub engine: Option<EngineKind>,
    pub ffmpeg_path: Option<PathBuf>,
    pub max_input_bytes: Option<u64>,
    pub max_input_pixels: Option<u64>,
    pub max_concurrent_runs: Option<usize>,
    pub forward_engine_logs: Option<bool>,
    pub download_timeout: Option<u64>,
    pub connect_timeout: Option<u64>,
    pub allow_private_network: Option<bool>,
    /// 结果默认保存目录。
    pub output_dir: Option<PathBuf>,
}

impl AppSettings {
    /// 读取设置文件；未指定路径时返回空设置。
    pub fn load(explicit: Option<&Path>) -> Result<Self, AppError> {
        let Some(path) = Self::resolve_path(explicit) else {
            return Ok(Self::default());
        };

        let content = fs::read_to_string(&path).map_err(|e| {
            AppError::Settings(format!("读取设置文件 '{}' 失败: {}", path.display(), e))
        })?;
        let settings = Self::from_json(&content)?;

        log::debug!("⚙️ 已加载设置文件: {}", path.display());
        Ok(settings)
    }

    pub fn from_json(content: &str) -> Result<Self, AppError> {
        serde_json::from_str(content).map_err(|e| AppError::Settings(format!("解析设置文件失败: {}", e)))
    }

    fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        explicit.map(Path::to_path_buf).or_else(|| {
            std::env::var_os(CONFIG_ENV_VAR)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
    }

    /// 把显式设置的字段覆盖到 `config` 上并校验。
    pub fn apply_to(&self, config: &mut DegradeConfig) -> Result<(), AppError> {
        if let Some(amount) = self.default_amount {
            config.default_amount = amount;
        }
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if let Some(engine) = self.engine {
            config.engine = engine;
        }
        if let Some(path) = &self.ffmpeg_path {
            config.ffmpeg_path = path.clone();
        }
        if let Some(bytes) = self.max_input_bytes {
            config.max_input_bytes = bytes;
        }
        if let Some(pixels) = self.max_input_pixels {
            config.max_input_pixels = pixels;
        }
        if let Some(runs) = self.max_concurrent_runs {
            config.max_concurrent_runs = runs;
        }
        if let Some(forward) = self.forward_engine_logs {
            config.forward_engine_logs = forward;
        }
        if let Some(timeout) = self.download_timeout {
            config.download_timeout = timeout;
        }
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout = timeout;
        }
        if let Some(allow) = self.allow_private_network {
            config.allow_private_network = allow;
        }

        config.validate()?;
        Ok(())
    }
}
