//! # 核心编排模块
//!
//! ## 设计思路
//!
//! `DegradeHandler` 只负责流程编排与配置管理，不直接接触像素。
//! 一次降质调用固定为：
//! 1. 校验输入（空字节、强度、体积、图片头、像素数）
//! 2. 获取就绪引擎
//! 3. 标记处理中，分配调用序号
//! 4. 生成本次调用独占的虚拟文件名
//! 5. 写入输入 → 逐轮执行 → 读回输出
//! 6. 清理临时文件，按序号决定是否发布结果
//!
//! ## 实现思路
//!
//! - 配置通过 `Arc<RwLock<DegradeConfig>>` 支持运行时切换策略，单次调用使用同一份快照。
//! - 每次调用的输入、中间、输出文件名都带随机 token，并发调用互不覆盖；
//!   额外用信号量限制同时进入引擎的调用数。
//! - 处理中标志由 `RunGuard` 保证成对增减：任何提前返回（含 future 被丢弃）都会落到 `RunFailed`。
//! - 记录 `write/exec/read/total` 阶段耗时，便于性能诊断。

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use bytes::Bytes;
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::sync::Semaphore;

use super::engine::{Engine, EngineError};
use super::filter::{ExecutionPlan, FilterParams};
use super::handle::ResultHandle;
use super::lifecycle::{EngineManager, delete_best_effort};
use super::source::{ImageDimensions, RawImageBuffer};
use super::store::{ResultStore, StoreAction};
use super::{DegradationStrategy, DegradeConfig, DegradeError};

/// 虚拟文件名中随机 token 的长度。
const NAME_TOKEN_LEN: usize = 10;

/// 降质编排器。
///
/// 持有配置、引擎生命周期与结果仓库，是唯一调度引擎的组件。
pub struct DegradeHandler {
    pub(super) config: Arc<RwLock<DegradeConfig>>,
    engine: Arc<EngineManager>,
    store: Arc<ResultStore>,
    run_permits: Arc<Semaphore>,
    next_seq: AtomicU64,
}

/// 处理中标志的 RAII 守卫。
struct RunGuard<'a> {
    store: &'a ResultStore,
    settled: bool,
}

impl<'a> RunGuard<'a> {
    fn start(store: &'a ResultStore) -> Self {
        store.dispatch(StoreAction::RunStarted);
        Self {
            store,
            settled: false,
        }
    }

    fn finish(mut self) {
        self.settled = true;
        self.store.dispatch(StoreAction::RunFinished);
    }

    fn fail(mut self, error: &DegradeError) {
        self.settled = true;
        self.store.dispatch(StoreAction::RunFailed(error.to_string()));
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.store
                .dispatch(StoreAction::RunFailed("降质调用被中途取消".to_string()));
        }
    }
}

impl DegradeHandler {
    /// 根据初始配置与引擎实例创建编排器。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use meme_degrader::degrade::{DegradeConfig, DegradeHandler, NativeEngine};
    ///
    /// let handler = DegradeHandler::new(DegradeConfig::default(), Arc::new(NativeEngine::new()))?;
    /// # Ok::<(), meme_degrader::degrade::DegradeError>(())
    /// ```
    pub fn new(config: DegradeConfig, engine: Arc<dyn Engine>) -> Result<Self, DegradeError> {
        config.validate()?;
        let permits = config.max_concurrent_runs;
        let manager = EngineManager::new(engine, config.forward_engine_logs);

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            engine: Arc::new(manager),
            store: Arc::new(ResultStore::new()),
            run_permits: Arc::new(Semaphore::new(permits)),
            next_seq: AtomicU64::new(0),
        })
    }

    /// 获取配置快照。
    pub(super) fn config_snapshot(&self) -> Result<DegradeConfig, DegradeError> {
        self.config
            .read()
            .map(|cfg| cfg.clone())
            .map_err(|_| DegradeError::ResourceLimit("配置读取锁已中毒".to_string()))
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn engine_manager(&self) -> &Arc<EngineManager> {
        &self.engine
    }

    /// 切换降质策略。
    pub fn set_strategy(&self, strategy: DegradationStrategy) -> Result<(), DegradeError> {
        let mut config = self
            .config
            .write()
            .map_err(|_| DegradeError::ResourceLimit("配置写入锁已中毒".to_string()))?;
        config.strategy = strategy;

        log::info!("⚙️ 已切换降质策略：{}（{} 轮）", strategy.as_str(), strategy.passes());
        Ok(())
    }

    pub fn get_strategy(&self) -> Result<DegradationStrategy, DegradeError> {
        Ok(self.config_snapshot()?.strategy)
    }

    /// 加载引擎并同步就绪状态。
    pub async fn initialize_engine(&self) -> Result<(), DegradeError> {
        let result = self.engine.initialize().await;
        self.store
            .dispatch(StoreAction::EngineReady(self.engine.is_ready()));
        result
    }

    pub fn engine_ready(&self) -> bool {
        self.engine.is_ready()
    }

    /// 释放引擎，仍在排队等待许可的调用以 `Cancelled` 结束。
    pub async fn teardown(&self) {
        if self.engine.is_ready() {
            self.run_permits.close();
        }
        self.engine.teardown().await;
        self.store.dispatch(StoreAction::EngineReady(false));
    }

    /// 清除当前结果；此前已开始的调用完成后也不再发布。
    pub fn reset(&self) {
        let floor = self.next_seq.load(Ordering::SeqCst);
        self.store.clear(floor);
        log::info!("🧽 已清除当前结果 - floor={}", floor);
    }

    /// 降质主入口。
    ///
    /// 成功时总是返回本次调用的结果句柄；是否成为仓库中的“当前结果”
    /// 取决于调用序号（更新的调用已发布、或调用开始后执行过 `reset`，则不发布）。
    pub async fn degrade(
        &self,
        raw: RawImageBuffer,
        amount: u32,
    ) -> Result<ResultHandle, DegradeError> {
        let config = self.config_snapshot()?;
        let total_start = Instant::now();

        let dims = Self::validate_input(&raw, amount, &config)?;
        let engine = self.engine.instance()?;

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = RunGuard::start(&self.store);

        let _permit = match self.run_permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let err = DegradeError::Cancelled("引擎已释放，排队中的调用被取消".to_string());
                guard.fail(&err);
                return Err(err);
            }
        };

        let params = FilterParams::for_amount(amount);
        let plan = ExecutionPlan::build(
            config.strategy,
            &params,
            dims,
            chrono::Utc::now().timestamp_millis(),
            &Self::name_token(),
            raw.extension(),
        );

        log::info!(
            "🎞️ 开始降质 - seq={} source={} {}x{} amount={} quality={} strategy={}",
            seq,
            raw.source_hint,
            dims.width,
            dims.height,
            amount,
            params.quality,
            config.strategy.as_str()
        );

        let outcome = self.run_plan(engine.as_ref(), &plan, raw.bytes.clone()).await;

        for name in plan.temporaries() {
            delete_best_effort(engine.as_ref(), name).await;
        }

        let output = match outcome {
            Ok(output) => output,
            Err(err) => {
                delete_best_effort(engine.as_ref(), &plan.output_name).await;
                log::warn!("❌ 降质失败 - seq={} code={} {}", seq, err.code(), err);
                guard.fail(&err);
                return Err(err);
            }
        };

        let output_dims = Self::probe_dimensions(&output).ok().or(Some(dims));
        let handle = ResultHandle::new(seq, &plan.output_name, output, output_dims);

        if self.store.set(handle.clone()) {
            self.engine.record_output(seq, &plan.output_name).await;
        } else {
            log::info!("⏭️ 结果已过期，不再发布 - seq={}", seq);
            delete_best_effort(engine.as_ref(), &plan.output_name).await;
        }
        guard.finish();

        log::info!(
            "✅ 降质完成 - seq={} output={} size={}KB total={}ms",
            seq,
            plan.output_name,
            handle.bytes().len() / 1024,
            total_start.elapsed().as_millis()
        );

        Ok(handle)
    }

    /// 写入输入、逐轮执行并读回输出。
    async fn run_plan(
        &self,
        engine: &dyn Engine,
        plan: &ExecutionPlan,
        input: Bytes,
    ) -> Result<Bytes, DegradeError> {
        let write_start = Instant::now();
        engine.write_file(&plan.input_name, input).await?;
        let write_elapsed = write_start.elapsed();

        let exec_start = Instant::now();
        for (index, pass) in plan.passes.iter().enumerate() {
            let code = engine.exec(&pass.argv).await?;
            if code != 0 {
                log::warn!(
                    "⚠️ 引擎退出码非零 - pass={}/{} code={} output={}",
                    index + 1,
                    plan.passes.len(),
                    code,
                    pass.output
                );
            }
        }
        let exec_elapsed = exec_start.elapsed();

        let read_start = Instant::now();
        let output = match engine.read_file(&plan.output_name).await {
            Ok(bytes) => bytes,
            Err(EngineError::FileNotFound(_)) => {
                return Err(DegradeError::ProcessingFailed(format!(
                    "引擎未产出结果文件：{}",
                    plan.output_name
                )));
            }
            Err(err) => return Err(err.into()),
        };
        if output.is_empty() {
            return Err(DegradeError::ProcessingFailed(format!(
                "结果文件为空：{}",
                plan.output_name
            )));
        }

        log::debug!(
            "⏱️ 阶段耗时 - write={}ms exec={}ms read={}ms",
            write_elapsed.as_millis(),
            exec_elapsed.as_millis(),
            read_start.elapsed().as_millis()
        );

        Ok(output)
    }

    /// 输入校验：不触碰引擎，不修改任何状态。
    pub(super) fn validate_input(
        raw: &RawImageBuffer,
        amount: u32,
        config: &DegradeConfig,
    ) -> Result<ImageDimensions, DegradeError> {
        if raw.is_empty() {
            return Err(DegradeError::InvalidInput("图片内容为空".to_string()));
        }
        if amount < 1 {
            return Err(DegradeError::InvalidInput(format!(
                "降质强度必须大于等于 1，当前为 {}",
                amount
            )));
        }
        if raw.len() as u64 > config.max_input_bytes {
            return Err(DegradeError::InvalidInput(format!(
                "图片过大：{:.2} MB（限制：{:.2} MB）",
                raw.len() as f64 / 1024.0 / 1024.0,
                config.max_input_bytes as f64 / 1024.0 / 1024.0
            )));
        }
        if !raw.mime().starts_with("image/") {
            return Err(DegradeError::InvalidInput("无法识别图片类型".to_string()));
        }

        let dims = Self::probe_dimensions(raw.bytes())?;
        if dims.width == 0 || dims.height == 0 {
            return Err(DegradeError::InvalidInput("图片尺寸为 0".to_string()));
        }
        if dims.pixels() > config.max_input_pixels {
            return Err(DegradeError::InvalidInput(format!(
                "图片像素过多：{}x{}（限制：{} 像素）",
                dims.width, dims.height, config.max_input_pixels
            )));
        }

        Ok(dims)
    }

    /// 只读取图片头获得尺寸。
    pub(super) fn probe_dimensions(bytes: &[u8]) -> Result<ImageDimensions, DegradeError> {
        let (width, height) = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| DegradeError::InvalidInput(format!("无法读取图片头：{}", e)))?
            .into_dimensions()
            .map_err(|e| DegradeError::InvalidInput(format!("无法解析图片尺寸：{}", e)))?;

        Ok(ImageDimensions { width, height })
    }

    fn name_token() -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(NAME_TOKEN_LEN)
            .map(char::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::degrade::engine::testing::{ScriptedEngine, create_png_bytes};
    use std::time::Duration;
    use tokio::sync::Notify;

    async fn ready_handler(engine: Arc<ScriptedEngine>) -> DegradeHandler {
        let handler =
            DegradeHandler::new(DegradeConfig::default(), engine).expect("handler init failed");
        handler.initialize_engine().await.expect("engine init failed");
        handler
    }

    fn png(width: u32, height: u32, seed: u8) -> RawImageBuffer {
        RawImageBuffer::new(create_png_bytes(width, height, seed))
    }

    #[tokio::test]
    async fn degrade_before_engine_ready_is_rejected() {
        let engine = Arc::new(ScriptedEngine::new());
        let handler =
            DegradeHandler::new(DegradeConfig::default(), engine.clone()).expect("handler");

        let result = handler.degrade(png(16, 16, 1), 3).await;

        assert!(matches!(result, Err(DegradeError::EngineNotReady(_))));
        assert!(!handler.store().is_processing());
        assert_eq!(engine.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_inputs_never_touch_the_engine() {
        let engine = Arc::new(ScriptedEngine::new());
        let handler = ready_handler(engine.clone()).await;

        let empty = handler.degrade(RawImageBuffer::new(Vec::new()), 3).await;
        assert!(matches!(empty, Err(DegradeError::InvalidInput(_))));

        let zero_amount = handler.degrade(png(8, 8, 1), 0).await;
        assert!(matches!(zero_amount, Err(DegradeError::InvalidInput(_))));

        let garbage = handler
            .degrade(RawImageBuffer::new(b"definitely not an image".to_vec()), 3)
            .await;
        assert!(matches!(garbage, Err(DegradeError::InvalidInput(_))));

        assert_eq!(engine.writes.load(Ordering::SeqCst), 0);
        assert!(handler.store().snapshot().result.is_none());
        assert!(!handler.store().is_processing());
    }

    #[tokio::test]
    async fn oversized_pixel_count_is_rejected() {
        let mut config = DegradeConfig::default();
        config.max_input_pixels = 100;
        let engine = Arc::new(ScriptedEngine::new());
        let handler = DegradeHandler::new(config, engine.clone()).expect("handler");
        handler.initialize_engine().await.expect("init");

        let result = handler.degrade(png(20, 20, 1), 3).await;

        assert!(matches!(result, Err(DegradeError::InvalidInput(_))));
        assert_eq!(engine.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_run_publishes_and_cleans_up() {
        let engine = Arc::new(ScriptedEngine::new());
        let handler = ready_handler(engine.clone()).await;

        let handle = handler.degrade(png(64, 40, 3), 3).await.expect("degrade");

        assert_eq!(handle.dimensions(), Some(ImageDimensions { width: 64, height: 40 }));
        assert!(handle.url().starts_with("blob:meme-degrader/"));
        assert!(handle.output_name().contains("-FILE-"));
        assert_eq!(handler.store().current().as_ref(), Some(&handle));
        assert!(!handler.store().is_processing());

        let files = engine.inner.list_files().await.expect("list");
        assert_eq!(files, vec![handle.output_name().to_string()]);
    }

    #[tokio::test]
    async fn missing_output_is_processing_failure() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.swallow_output.store(true, Ordering::SeqCst);
        let handler = ready_handler(engine.clone()).await;

        let result = handler.degrade(png(32, 32, 4), 3).await;

        assert!(matches!(result, Err(DegradeError::ProcessingFailed(_))));
        let state = handler.store().snapshot();
        assert!(!state.is_processing());
        assert!(state.last_error.is_some());
        assert!(state.result.is_none());
        assert!(engine.inner.list_files().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn processing_flag_is_raised_while_engine_runs() {
        let gate = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());
        let mut scripted = ScriptedEngine::new();
        scripted.exec_gate = Some(gate.clone());
        scripted.exec_entered = Some(entered.clone());
        let handler = Arc::new(ready_handler(Arc::new(scripted)).await);

        let task = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.degrade(png(24, 24, 5), 3).await })
        };

        entered.notified().await;
        assert!(handler.store().is_processing());

        gate.notify_one();
        task.await.expect("join").expect("degrade");
        assert!(!handler.store().is_processing());
    }

    #[tokio::test]
    async fn concurrent_runs_match_sequential_outputs() {
        let inputs: Vec<Vec<u8>> = (0..4u8)
            .map(|seed| create_png_bytes(40 + seed as u32, 30, seed * 17))
            .collect();

        let sequential = ready_handler(Arc::new(ScriptedEngine::new())).await;
        let mut expected = Vec::new();
        for bytes in &inputs {
            let handle = sequential
                .degrade(RawImageBuffer::new(bytes.clone()), 3)
                .await
                .expect("sequential degrade");
            expected.push(handle.bytes().clone());
        }

        let concurrent = Arc::new(ready_handler(Arc::new(ScriptedEngine::new())).await);
        let mut tasks = Vec::new();
        for bytes in inputs.clone() {
            let handler = Arc::clone(&concurrent);
            tasks.push(tokio::spawn(async move {
                handler.degrade(RawImageBuffer::new(bytes), 3).await
            }));
        }

        for (task, expected) in tasks.into_iter().zip(expected) {
            let handle = task.await.expect("join").expect("concurrent degrade");
            assert_eq!(handle.bytes(), &expected);
        }
        assert!(!concurrent.store().is_processing());
    }

    #[tokio::test]
    async fn identical_input_yields_identical_bytes() {
        let handler = ready_handler(Arc::new(ScriptedEngine::new())).await;
        let bytes = create_png_bytes(50, 50, 9);

        let first = handler
            .degrade(RawImageBuffer::new(bytes.clone()), 4)
            .await
            .expect("first");
        let second = handler
            .degrade(RawImageBuffer::new(bytes), 4)
            .await
            .expect("second");

        assert_eq!(first.bytes(), second.bytes());
        assert!(second.seq() > first.seq());
        assert_eq!(handler.store().current().map(|h| h.seq()), Some(second.seq()));
    }

    #[tokio::test]
    async fn reset_blocks_results_of_runs_already_in_flight() {
        let gate = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());
        let mut scripted = ScriptedEngine::new();
        scripted.exec_gate = Some(gate.clone());
        scripted.exec_entered = Some(entered.clone());
        let engine = Arc::new(scripted);
        let handler = Arc::new(ready_handler(engine.clone()).await);

        let task = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.degrade(png(20, 20, 6), 3).await })
        };

        entered.notified().await;
        handler.reset();
        gate.notify_one();

        let handle = task.await.expect("join").expect("degrade");
        assert!(handler.store().current().is_none());
        assert!(!handler.store().is_processing());
        assert!(
            !engine
                .inner
                .list_files()
                .await
                .expect("list")
                .contains(&handle.output_name().to_string())
        );
    }

    #[tokio::test]
    async fn reset_then_degrade_publishes_again() {
        let handler = ready_handler(Arc::new(ScriptedEngine::new())).await;
        handler.degrade(png(16, 16, 1), 3).await.expect("first");

        handler.reset();
        assert!(handler.store().current().is_none());

        let next = handler.degrade(png(16, 16, 2), 3).await.expect("after reset");
        assert_eq!(handler.store().current().map(|h| h.seq()), Some(next.seq()));
        assert!(!handler.store().is_processing());

        handler.reset();
        handler.reset();
        let again = handler.degrade(png(16, 16, 3), 3).await.expect("after double reset");
        assert_eq!(handler.store().current().map(|h| h.seq()), Some(again.seq()));
    }

    #[tokio::test]
    async fn triple_pass_leaves_no_intermediates() {
        let engine = Arc::new(ScriptedEngine::new());
        let handler = ready_handler(engine.clone()).await;
        handler
            .set_strategy(DegradationStrategy::TriplePass)
            .expect("set strategy");

        let handle = handler.degrade(png(48, 36, 7), 3).await.expect("degrade");

        assert_eq!(engine.execs.load(Ordering::SeqCst), 3);
        assert_eq!(
            engine.inner.list_files().await.expect("list"),
            vec![handle.output_name().to_string()]
        );
        assert_eq!(handle.dimensions(), Some(ImageDimensions { width: 48, height: 36 }));
    }

    #[tokio::test]
    async fn dropped_run_lowers_processing_flag() {
        let gate = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());
        let mut scripted = ScriptedEngine::new();
        scripted.exec_gate = Some(gate);
        scripted.exec_entered = Some(entered.clone());
        let handler = Arc::new(ready_handler(Arc::new(scripted)).await);

        let task = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.degrade(png(12, 12, 8), 3).await })
        };

        entered.notified().await;
        task.abort();
        let _ = task.await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handler.store().is_processing());
    }

    #[test]
    fn name_tokens_are_alphanumeric() {
        let token = DegradeHandler::name_token();
        assert_eq!(token.len(), NAME_TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
