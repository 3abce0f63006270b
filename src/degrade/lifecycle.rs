//! # 引擎生命周期管理
//!
//! ## 设计思路
//!
//! 引擎实例由调用方显式创建并注入（而非全局单例），`EngineManager` 负责：
//! 1. 异步加载且只加载一次（并发调用排队等待同一次加载）
//! 2. 就绪门禁：未就绪时 `instance()` 立即返回 `EngineNotReady`
//! 3. 释放：删除最近一次输出的虚拟文件并放弃实例引用
//!
//! ## 实现思路
//!
//! - 加载与释放共用一把 `tokio::sync::Mutex`，保证二者不会交错。
//! - 开发配置下启动一个转发任务，把引擎日志写入 `log`（target = `engine`）。
//! - `teardown` 后实例被丢弃，再次 `initialize` 返回 `EngineNotReady`。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::DegradeError;
use super::engine::{Engine, EngineError, EngineLogLevel};

/// 引擎生命周期管理器。
pub struct EngineManager {
    engine: RwLock<Option<Arc<dyn Engine>>>,
    ready: AtomicBool,
    load_lock: tokio::sync::Mutex<()>,
    last_output: Mutex<Option<(u64, String)>>,
    log_task: Mutex<Option<JoinHandle<()>>>,
    forward_logs: bool,
}

impl EngineManager {
    pub fn new(engine: Arc<dyn Engine>, forward_logs: bool) -> Self {
        Self {
            engine: RwLock::new(Some(engine)),
            ready: AtomicBool::new(false),
            load_lock: tokio::sync::Mutex::new(()),
            last_output: Mutex::new(None),
            log_task: Mutex::new(None),
            forward_logs,
        }
    }

    fn engine_ref(&self) -> Result<Option<Arc<dyn Engine>>, DegradeError> {
        self.engine
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| DegradeError::ResourceLimit("引擎实例锁已中毒".to_string()))
    }

    /// 加载引擎。已加载时直接返回；并发调用只会触发一次真实加载。
    pub async fn initialize(&self) -> Result<(), DegradeError> {
        if self.is_ready() {
            return Ok(());
        }

        let _load_guard = self.load_lock.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        let engine = self
            .engine_ref()?
            .ok_or_else(|| DegradeError::EngineNotReady("引擎实例已释放".to_string()))?;

        let load_start = Instant::now();
        log::info!("⏳ 开始加载图像引擎 - engine={}", engine.name());

        engine.load().await.map_err(|e| match e {
            EngineError::NotLoaded | EngineError::Released | EngineError::LoadFailed(_) => {
                DegradeError::EngineNotReady(e.to_string())
            }
            other => DegradeError::from(other),
        })?;

        if self.forward_logs {
            let task = Self::spawn_log_forwarder(&engine);
            if let Ok(mut slot) = self.log_task.lock() {
                if let Some(previous) = slot.replace(task) {
                    previous.abort();
                }
            }
        }

        self.ready.store(true, Ordering::SeqCst);
        log::info!(
            "✅ 图像引擎加载完成 - engine={} elapsed={}ms",
            engine.name(),
            load_start.elapsed().as_millis()
        );

        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// 获取已就绪的引擎实例。
    pub fn instance(&self) -> Result<Arc<dyn Engine>, DegradeError> {
        if !self.is_ready() {
            return Err(DegradeError::EngineNotReady("引擎仍在加载，请稍后再试".to_string()));
        }
        self.engine_ref()?
            .ok_or_else(|| DegradeError::EngineNotReady("引擎实例已释放".to_string()))
    }

    /// 记录最近一次输出文件名，并删除被替换掉的那一个。
    ///
    /// `seq` 小于已记录序号时说明有更新的输出先登记了，此时删除的是 `name` 自己。
    pub async fn record_output(&self, seq: u64, name: &str) {
        let stale = match self.last_output.lock() {
            Ok(mut slot) => {
                let superseded = slot.as_ref().is_some_and(|(recorded, _)| *recorded > seq);
                if superseded {
                    Some(name.to_string())
                } else {
                    slot.replace((seq, name.to_string()))
                        .map(|(_, previous)| previous)
                        .filter(|previous| previous != name)
                }
            }
            Err(_) => {
                log::warn!("⚠️ 输出记录锁已中毒，跳过记录：{}", name);
                return;
            }
        };

        if let Some(stale) = stale {
            if let Ok(engine) = self.instance() {
                delete_best_effort(engine.as_ref(), &stale).await;
            }
        }
    }

    pub fn last_output(&self) -> Option<String> {
        self.last_output
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|(_, name)| name.clone()))
    }

    /// 释放引擎：删除最近一次输出文件、停止日志转发、放弃实例引用。
    ///
    /// 从未加载时为空操作。进行中的调用不会被等待。
    pub async fn teardown(&self) {
        let _load_guard = self.load_lock.lock().await;
        if !self.is_ready() {
            return;
        }

        let engine = match self.engine_ref() {
            Ok(engine) => engine,
            Err(err) => {
                log::warn!("⚠️ 释放引擎时读取实例失败：{}", err);
                None
            }
        };

        let last_output = self
            .last_output
            .lock()
            .ok()
            .and_then(|mut slot| slot.take().map(|(_, name)| name));
        if let (Some(engine), Some(name)) = (engine.as_ref(), last_output) {
            delete_best_effort(engine.as_ref(), &name).await;
        }

        if let Ok(mut slot) = self.log_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }

        self.ready.store(false, Ordering::SeqCst);
        match self.engine.write() {
            Ok(mut slot) => {
                slot.take();
            }
            Err(_) => log::warn!("⚠️ 引擎实例锁已中毒，实例未能释放"),
        }

        log::info!("🧹 图像引擎已释放");
    }

    fn spawn_log_forwarder(engine: &Arc<dyn Engine>) -> JoinHandle<()> {
        let mut logs = engine.subscribe_logs();
        let name = engine.name();

        tokio::spawn(async move {
            loop {
                match logs.recv().await {
                    Ok(event) => match event.level {
                        EngineLogLevel::Info => {
                            log::debug!(target: "engine", "[{}] {}", name, event.message)
                        }
                        EngineLogLevel::Warn | EngineLogLevel::Error => {
                            log::warn!(target: "engine", "[{}] {}", name, event.message)
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!(target: "engine", "[{}] 丢弃 {} 条积压日志", name, skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// 尽力删除虚拟文件；文件本就不存在时静默，其它失败只记日志。
pub(crate) async fn delete_best_effort(engine: &dyn Engine, name: &str) {
    match engine.delete_file(name).await {
        Ok(()) => log::debug!("🗑️ 已删除虚拟文件：{}", name),
        Err(EngineError::FileNotFound(_)) => {}
        Err(err) => {
            let err = DegradeError::CleanupFailed(format!("{}：{}", name, err));
            log::warn!("⚠️ {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::degrade::engine::testing::ScriptedEngine;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn instance_before_initialize_is_not_ready() {
        let manager = EngineManager::new(Arc::new(ScriptedEngine::new()), false);
        assert!(!manager.is_ready());
        assert!(matches!(manager.instance(), Err(DegradeError::EngineNotReady(_))));
    }

    #[tokio::test]
    async fn concurrent_initialize_loads_once() {
        let mut scripted = ScriptedEngine::new();
        scripted.load_delay = Some(Duration::from_millis(30));
        let engine = Arc::new(scripted);
        let manager = Arc::new(EngineManager::new(engine.clone(), true));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { manager.initialize().await }));
        }
        for handle in handles {
            handle.await.expect("join").expect("initialize");
        }

        assert!(manager.is_ready());
        assert_eq!(engine.loads.load(Ordering::SeqCst), 1);
        manager.initialize().await.expect("repeat initialize");
        assert_eq!(engine.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn teardown_without_initialize_is_noop() {
        let manager = EngineManager::new(Arc::new(ScriptedEngine::new()), false);
        manager.teardown().await;
        manager.initialize().await.expect("initialize after no-op teardown");
        assert!(manager.is_ready());
    }

    #[tokio::test]
    async fn teardown_deletes_last_output_and_releases_instance() {
        let engine = Arc::new(ScriptedEngine::new());
        let manager = EngineManager::new(engine.clone(), false);
        manager.initialize().await.expect("initialize");

        let instance = manager.instance().expect("instance");
        instance
            .write_file("1-FILE-a.png", Bytes::from_static(b"a"))
            .await
            .expect("write");
        manager.record_output(1, "1-FILE-a.png").await;

        manager.teardown().await;

        assert!(engine.inner.list_files().await.expect("list").is_empty());
        assert!(matches!(manager.instance(), Err(DegradeError::EngineNotReady(_))));
        assert!(matches!(manager.initialize().await, Err(DegradeError::EngineNotReady(_))));
    }

    #[tokio::test]
    async fn record_output_replaces_previous_file() {
        let engine = Arc::new(ScriptedEngine::new());
        let manager = EngineManager::new(engine.clone(), false);
        manager.initialize().await.expect("initialize");

        let instance = manager.instance().expect("instance");
        for (seq, name) in [(1, "1-FILE-a.png"), (3, "3-FILE-c.png"), (2, "2-FILE-b.png")] {
            instance
                .write_file(name, Bytes::from_static(b"x"))
                .await
                .expect("write");
            manager.record_output(seq, name).await;
        }

        assert_eq!(manager.last_output().as_deref(), Some("3-FILE-c.png"));
        assert_eq!(
            engine.inner.list_files().await.expect("list"),
            vec!["3-FILE-c.png".to_string()]
        );
    }
}
