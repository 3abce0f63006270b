//! # 降质流水线模块（degrade）
//!
//! ## 设计思路
//!
//! 该模块将“输入归一 → 引擎生命周期 → 降质编排 → 结果发布 → 命令暴露”
//! 按职责拆分为多个子模块，避免单文件膨胀与耦合。
//!
//! - `commands`：仅做入参/出参适配（薄封装）
//! - `service`：承载可注入状态（`DegradeServiceState`）
//! - `handler`：编排整条降质流水线
//! - `loader`：负责文件 / Data URL / URL / 剪贴板加载与安全校验
//! - `filter`：强度 → 缩放系数、质量、滤镜链、执行计划
//! - `lifecycle`：引擎加载、就绪门禁与释放
//! - `store` / `handle`：展示层状态与结果句柄
//! - `engine`：引擎能力接口与两种实现
//! - `config/error/source`：配置、错误、中间数据模型
//!
//! ## 实现思路
//!
//! 对外仅暴露必要类型与命令函数，内部细节保持 `mod` 私有。
//! 宿主通过 `DegradeServiceState` 持有状态，提升测试隔离与后续扩展能力。
//!
//! ## 新同事快速上手
//!
//! 可以按下面顺序理解调用链：
//!
//! ```text
//! CLI / 宿主调用
//!    ↓
//! commands.rs（参数适配）
//!    ↓
//! service.rs（状态持有、服务入口）
//!    ↓
//! handler.rs（统一编排 + 阶段耗时日志）
//!    ├─ loader.rs（来源加载 + URL/体积安全校验）
//!    ├─ lifecycle.rs（就绪引擎实例）
//!    ├─ filter.rs（参数推导 + 执行计划）
//!    ├─ engine/（写入 → 执行 → 读回 → 删除）
//!    └─ store.rs（按序号发布结果）
//!    ↓
//! 返回 ResultHandle / DegradeCommandError
//! ```
//!
//! ## 分层职责建议
//!
//! - 调用入口变更（命令名/参数）优先改 `commands.rs`
//! - 配置与策略变更优先改 `config.rs`
//! - 流程顺序变更优先改 `handler.rs`
//! - 画质参数变更只改 `filter.rs`
//! - 新的引擎实现只需实现 `engine::Engine`

pub mod commands;
mod config;
pub mod engine;
mod error;
pub mod filter;
mod handle;
mod handler;
mod lifecycle;
mod loader;
mod service;
mod source;
mod store;

pub use config::{DEFAULT_AMOUNT, DegradationStrategy, DegradeConfig, EngineKind};
pub use engine::{Engine, EngineError, FfmpegEngine, NativeEngine};
pub use error::DegradeError;
pub use handle::{RESULT_URL_SCHEME, ResultHandle};
pub use handler::DegradeHandler;
pub use lifecycle::EngineManager;
pub use service::{DegradeServiceState, engine_for_config};
pub use source::{ImageDimensions, ImageSource, RawImageBuffer};
pub use store::{ResultStore, StoreAction, ViewState, reduce};
