//! # 外部 ffmpeg 引擎
//!
//! ## 设计思路
//!
//! 以子进程方式调用系统 ffmpeg。虚拟文件系统映射为一个私有临时目录，
//! 引擎释放时目录随 `TempDir` 一起删除。
//!
//! ## 实现思路
//!
//! - `load`：执行 `<ffmpeg> -version` 确认可用，并创建私有工作目录。
//! - `exec`：在工作目录中运行 ffmpeg，前置 `-hide_banner -nostdin -y`，
//!   stderr 逐行转成日志事件，返回退出码。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;

use super::{
    Engine, EngineError, EngineLogEvent, LOG_CHANNEL_CAPACITY, validate_virtual_name,
};

const EXEC_PREFIX: [&str; 3] = ["-hide_banner", "-nostdin", "-y"];

/// ffmpeg 子进程引擎。
pub struct FfmpegEngine {
    binary: PathBuf,
    workdir: RwLock<Option<TempDir>>,
    logs: broadcast::Sender<EngineLogEvent>,
}

impl FfmpegEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        let (logs, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            binary: binary.into(),
            workdir: RwLock::new(None),
            logs,
        }
    }

    fn workdir_path(&self) -> Result<PathBuf, EngineError> {
        let guard = self
            .workdir
            .read()
            .map_err(|_| EngineError::Exec("工作目录锁已中毒".to_string()))?;
        guard
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .ok_or(EngineError::NotLoaded)
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, EngineError> {
        validate_virtual_name(name)?;
        Ok(self.workdir_path()?.join(name))
    }

    fn emit(&self, event: EngineLogEvent) {
        let _ = self.logs.send(event);
    }

    async fn probe_version(binary: &Path) -> Result<String, EngineError> {
        let output = Command::new(binary)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::LoadFailed(format!("无法启动 {}：{}", binary.display(), e)))?;

        if !output.status.success() {
            return Err(EngineError::LoadFailed(format!(
                "{} -version 退出码异常：{:?}",
                binary.display(),
                output.status.code()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or("unknown").to_string())
    }
}

fn map_not_found(error: std::io::Error, name: &str) -> EngineError {
    if error.kind() == std::io::ErrorKind::NotFound {
        EngineError::FileNotFound(name.to_string())
    } else {
        EngineError::Io(error)
    }
}

#[async_trait]
impl Engine for FfmpegEngine {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn load(&self) -> Result<(), EngineError> {
        let version = Self::probe_version(&self.binary).await?;

        let dir = tempfile::Builder::new()
            .prefix("meme-degrader-")
            .tempdir()
            .map_err(|e| EngineError::LoadFailed(format!("创建工作目录失败：{}", e)))?;

        log::debug!("🎬 ffmpeg 工作目录：{}", dir.path().display());
        self.emit(EngineLogEvent::info(version));

        let mut guard = self
            .workdir
            .write()
            .map_err(|_| EngineError::Exec("工作目录锁已中毒".to_string()))?;
        *guard = Some(dir);
        Ok(())
    }

    async fn write_file(&self, name: &str, bytes: Bytes) -> Result<(), EngineError> {
        let path = self.resolve(name)?;
        tokio::fs::write(path, &bytes).await?;
        Ok(())
    }

    async fn exec(&self, argv: &[String]) -> Result<i32, EngineError> {
        let workdir = self.workdir_path()?;

        let mut child = Command::new(&self.binary)
            .args(EXEC_PREFIX)
            .args(argv)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Exec(format!("无法启动 ffmpeg：{}", e)))?;

        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                self.emit(EngineLogEvent::info(line));
            }
        }

        let status = child.wait().await?;
        let code = status.code().unwrap_or(-1);
        if code != 0 {
            self.emit(EngineLogEvent::error(format!("ffmpeg exited with code {}", code)));
        }
        Ok(code)
    }

    async fn read_file(&self, name: &str) -> Result<Bytes, EngineError> {
        let path = self.resolve(name)?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| map_not_found(e, name))?;
        Ok(Bytes::from(bytes))
    }

    async fn delete_file(&self, name: &str) -> Result<(), EngineError> {
        let path = self.resolve(name)?;
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| map_not_found(e, name))
    }

    async fn list_files(&self) -> Result<Vec<String>, EngineError> {
        let workdir = self.workdir_path()?;
        let mut entries = tokio::fs::read_dir(workdir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn subscribe_logs(&self) -> broadcast::Receiver<EngineLogEvent> {
        self.logs.subscribe()
    }
}
