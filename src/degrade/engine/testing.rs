//! 测试用引擎替身：包装 `NativeEngine`，可注入加载延迟、执行闸门与“无输出”故障。

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba};
use tokio::sync::{Notify, broadcast};

use super::{Engine, EngineError, EngineLogEvent, NativeEngine};

pub(crate) fn create_png_bytes(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        let r = ((x * 7) % 255) as u8 ^ seed;
        let g = ((y * 3) % 255) as u8;
        let b = ((x + y) % 255) as u8 ^ seed.rotate_left(3);
        Rgba([r, g, b, 255])
    });

    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut cursor, ImageFormat::Png)
        .expect("failed to encode test image");
    cursor.into_inner()
}

#[derive(Default)]
pub(crate) struct ScriptedEngine {
    pub(crate) inner: NativeEngine,
    pub(crate) loads: AtomicUsize,
    pub(crate) writes: AtomicUsize,
    pub(crate) execs: AtomicUsize,
    pub(crate) load_delay: Option<Duration>,
    /// 为 true 时 `exec` 返回 0 但不产出任何文件。
    pub(crate) swallow_output: AtomicBool,
    /// 设置后每次 `exec` 先等待一次通知。
    pub(crate) exec_gate: Option<Arc<Notify>>,
    /// `exec` 进入等待前发出的通知。
    pub(crate) exec_entered: Option<Arc<Notify>>,
}

impl ScriptedEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn load(&self) -> Result<(), EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.load().await
    }

    async fn write_file(&self, name: &str, bytes: Bytes) -> Result<(), EngineError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_file(name, bytes).await
    }

    async fn exec(&self, argv: &[String]) -> Result<i32, EngineError> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        if let Some(entered) = &self.exec_entered {
            entered.notify_one();
        }
        if let Some(gate) = &self.exec_gate {
            gate.notified().await;
        }
        if self.swallow_output.load(Ordering::SeqCst) {
            return Ok(0);
        }
        self.inner.exec(argv).await
    }

    async fn read_file(&self, name: &str) -> Result<Bytes, EngineError> {
        self.inner.read_file(name).await
    }

    async fn delete_file(&self, name: &str) -> Result<(), EngineError> {
        self.inner.delete_file(name).await
    }

    async fn list_files(&self) -> Result<Vec<String>, EngineError> {
        self.inner.list_files().await
    }

    fn subscribe_logs(&self) -> broadcast::Receiver<EngineLogEvent> {
        self.inner.subscribe_logs()
    }
}
