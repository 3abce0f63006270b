//! 结果存储模块
//!
//! # 设计思路
//!
//! 统一管理降质结果的落盘路径：用户可以给出完整文件路径、已有目录，
//! 或者什么都不给（回退到设置中的 `output_dir`，再回退到当前目录）。
//!
//! # 实现思路
//!
//! - 目标是目录时，文件名取“输入文件名 + `-degraded`”，无输入名时用结果的虚拟文件名。
//! - 目录不存在时自动 `create_dir_all`，避免上层判断。
//! - 所有可能失败的操作均返回 `Result`，不使用 `expect()` / `unwrap()`。

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::degrade::ResultHandle;
use crate::error::AppError;

/// 已保存结果的信息。
#[derive(Debug, Clone, Serialize)]
pub struct SavedResult {
    pub path: String,
    pub size: u64,
}

/// 获取输出目录，不存在时自动创建。
///
/// # 返回
/// - `Ok(PathBuf)` — 可用的输出目录
/// - `Err(AppError::Storage)` — 无法创建目录
pub fn get_output_dir(custom_dir: Option<&Path>) -> Result<PathBuf, AppError> {
    let dir = match custom_dir {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| {
            AppError::Storage(format!("创建输出目录 '{}' 失败: {}", dir.display(), e))
        })?;
    }
    Ok(dir)
}

/// 计算结果文件路径。
///
/// * `explicit` - 命令行 `-o` 给出的路径（文件或目录）
/// * `default_dir` - 设置中的默认输出目录
/// * `input_name` - 输入文件路径（用于推导文件名）
pub fn resolve_output_path(
    explicit: Option<&Path>,
    default_dir: Option<&Path>,
    input_name: Option<&str>,
    handle: &ResultHandle,
) -> Result<PathBuf, AppError> {
    if let Some(path) = explicit {
        if !path.is_dir() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                get_output_dir(Some(parent))?;
            }
            return Ok(path.to_path_buf());
        }
        return Ok(path.join(default_file_name(input_name, handle)));
    }

    let dir = get_output_dir(default_dir)?;
    Ok(dir.join(default_file_name(input_name, handle)))
}

fn default_file_name(input_name: Option<&str>, handle: &ResultHandle) -> String {
    input_name
        .and_then(|name| Path::new(name).file_stem())
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(|stem| format!("{}-degraded.png", stem))
        .unwrap_or_else(|| handle.output_name().to_string())
}

/// 将结果字节写入目标路径。
pub fn save_result(path: &Path, handle: &ResultHandle) -> Result<SavedResult, AppError> {
    fs::write(path, handle.bytes())?;
    log::info!("💾 结果已保存: {} ({} bytes)", path.display(), handle.bytes().len());

    Ok(SavedResult {
        path: path.to_string_lossy().to_string(),
        size: handle.bytes().len() as u64,
    })
}
