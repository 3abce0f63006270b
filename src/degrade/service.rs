//! # 服务层（可注入状态）
//!
//! ## 设计思路
//!
//! 使用 `DegradeServiceState` 作为可注入状态，替代全局单例函数。
//! 好处：
//! 1. 生命周期清晰（由 `main.rs` 或宿主统一管理）
//! 2. 测试可创建独立实例，并注入替身引擎
//! 3. 同一进程可以按会话持有多个实例
//!
//! ## 实现思路
//!
//! 对外仅暴露少量稳定 API：
//! - `initialize_engine` / `teardown`：引擎生命周期
//! - `process_source` / `degrade_bytes`：执行完整降质链路
//! - `reset` / `snapshot` / `subscribe`：展示层状态
//! - `set_strategy` / `get_strategy`：切换降质策略

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use super::engine::{Engine, FfmpegEngine, NativeEngine};
use super::{
    DegradationStrategy, DegradeConfig, DegradeError, DegradeHandler, EngineKind, ImageSource,
    RawImageBuffer, ResultHandle, ViewState,
};

/// 降质服务状态。
pub struct DegradeServiceState {
    handler: DegradeHandler,
}

impl DegradeServiceState {
    /// 使用默认配置（内置引擎）创建服务状态。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use meme_degrader::degrade::DegradeServiceState;
    ///
    /// let service = DegradeServiceState::new()?;
    /// # Ok::<(), meme_degrader::degrade::DegradeError>(())
    /// ```
    pub fn new() -> Result<Self, DegradeError> {
        Self::with_config(DegradeConfig::default())
    }

    /// 使用自定义配置创建服务状态，引擎实现由 `config.engine` 决定。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use meme_degrader::degrade::{DegradeConfig, DegradeServiceState, EngineKind};
    ///
    /// let mut config = DegradeConfig::default();
    /// config.engine = EngineKind::Ffmpeg;
    /// let service = DegradeServiceState::with_config(config)?;
    /// # Ok::<(), meme_degrader::degrade::DegradeError>(())
    /// ```
    pub fn with_config(config: DegradeConfig) -> Result<Self, DegradeError> {
        let engine = engine_for_config(&config);
        Self::with_engine(config, engine)
    }

    /// 注入自定义引擎实现。
    pub fn with_engine(config: DegradeConfig, engine: Arc<dyn Engine>) -> Result<Self, DegradeError> {
        Ok(Self {
            handler: DegradeHandler::new(config, engine)?,
        })
    }

    pub async fn initialize_engine(&self) -> Result<(), DegradeError> {
        self.handler.initialize_engine().await
    }

    pub fn engine_ready(&self) -> bool {
        self.handler.engine_ready()
    }

    /// 执行完整流程：加载 → 降质 → 发布。
    ///
    /// `amount` 为空时使用配置中的默认强度。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use meme_degrader::degrade::{DegradeServiceState, ImageSource};
    ///
    /// # async fn demo() -> Result<(), meme_degrader::degrade::DegradeError> {
    /// let service = DegradeServiceState::new()?;
    /// service.initialize_engine().await?;
    /// let handle = service
    ///     .process_source(ImageSource::FilePath("meme.png".into()), None)
    ///     .await?;
    /// println!("{}", handle.url());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn process_source(
        &self,
        source: ImageSource,
        amount: Option<u32>,
    ) -> Result<ResultHandle, DegradeError> {
        let amount = match amount {
            Some(amount) => amount,
            None => self.handler.config_snapshot()?.default_amount,
        };
        let raw = self.handler.load_source(source).await?;
        self.handler.degrade(raw, amount).await
    }

    /// 直接降质调用方已持有的字节。
    pub async fn degrade_bytes(
        &self,
        bytes: impl Into<Bytes>,
        amount: u32,
    ) -> Result<ResultHandle, DegradeError> {
        self.handler.degrade(RawImageBuffer::new(bytes), amount).await
    }

    pub fn reset(&self) {
        self.handler.reset();
    }

    pub fn snapshot(&self) -> ViewState {
        self.handler.store().snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.handler.store().subscribe()
    }

    /// 按结果 URL 取回字节（仅当前结果）。
    pub fn resolve(&self, url: &str) -> Option<Bytes> {
        self.handler.store().resolve(url)
    }

    /// 设置降质策略（`single` / `triple`）。
    pub fn set_strategy(&self, strategy: &str) -> Result<(), DegradeError> {
        let strategy = DegradationStrategy::from_str(strategy)?;
        self.handler.set_strategy(strategy)
    }

    /// 获取当前生效策略（字符串）。
    pub fn get_strategy(&self) -> Result<String, DegradeError> {
        Ok(self.handler.get_strategy()?.as_str().to_string())
    }

    pub async fn teardown(&self) {
        self.handler.teardown().await;
    }
}

/// 按配置构建引擎实例。
pub fn engine_for_config(config: &DegradeConfig) -> Arc<dyn Engine> {
    match config.engine {
        EngineKind::Native => {
            Arc::new(NativeEngine::new().with_max_frame_pixels(config.max_input_pixels))
        }
        EngineKind::Ffmpeg => Arc::new(FfmpegEngine::new(config.ffmpeg_path.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::degrade::engine::testing::{ScriptedEngine, create_png_bytes};
    use std::thread;

    fn service() -> DegradeServiceState {
        DegradeServiceState::with_engine(DegradeConfig::default(), Arc::new(ScriptedEngine::new()))
            .expect("service init failed")
    }

    #[test]
    fn service_set_and_get_strategy_roundtrip() {
        let service = service();

        service.set_strategy("triple").expect("set triple should succeed");
        assert_eq!(service.get_strategy().expect("get strategy"), "triple");

        service.set_strategy("single-pass").expect("set single should succeed");
        assert_eq!(service.get_strategy().expect("get strategy"), "single");
    }

    #[test]
    fn service_rejects_invalid_strategy() {
        let service = service();

        let result = service.set_strategy("quintuple");
        assert!(matches!(result, Err(DegradeError::InvalidInput(_))));
        assert_eq!(service.get_strategy().expect("get strategy"), "single");
    }

    #[test]
    fn service_strategy_concurrent_access_stress() {
        let service = Arc::new(service());

        let mut handles = Vec::new();
        for worker_id in 0..8usize {
            let service = Arc::clone(&service);
            handles.push(thread::spawn(move || {
                let strategies = ["single", "triple", "bogus"];
                for i in 0..150 {
                    let strategy = strategies[(worker_id + i) % strategies.len()];
                    let result = service.set_strategy(strategy);
                    assert_eq!(result.is_ok(), strategy != "bogus");

                    let current = service.get_strategy().expect("get strategy");
                    assert!(matches!(current.as_str(), "single" | "triple"));
                }
            }));
        }

        for handle in handles {
            handle.join().expect("worker thread should not panic");
        }
    }

    #[tokio::test]
    async fn process_source_uses_default_amount() {
        let service = service();
        service.initialize_engine().await.expect("init");
        assert!(service.snapshot().engine_ready);

        let bytes = Bytes::from(create_png_bytes(30, 30, 1));
        let handle = service
            .process_source(ImageSource::Bytes(bytes), None)
            .await
            .expect("process");

        assert_eq!(service.resolve(handle.url()), Some(handle.bytes().clone()));
        service.reset();
        assert!(service.snapshot().result.is_none());
        assert_eq!(service.resolve(handle.url()), None);
    }

    #[tokio::test]
    async fn teardown_reports_engine_not_ready() {
        let service = service();
        service.initialize_engine().await.expect("init");
        service.teardown().await;

        assert!(!service.engine_ready());
        assert!(!service.snapshot().engine_ready);
        let result = service.degrade_bytes(create_png_bytes(8, 8, 2), 3).await;
        assert!(matches!(result, Err(DegradeError::EngineNotReady(_))));
    }

    #[tokio::test]
    async fn subscribers_see_engine_become_ready() {
        let service = service();
        let mut rx = service.subscribe();

        service.initialize_engine().await.expect("init");
        rx.changed().await.expect("state change");
        assert!(rx.borrow().engine_ready);
    }
}
