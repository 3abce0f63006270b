//! # 表情包降质工具 — 库入口
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │            调用方（CLI / 宿主程序 / 测试）                │
//! │                                                          │
//! │  文件 ── Data URL ── 网络地址 ── 剪贴板 ── 原始字节      │
//! │       │  (统一归一为 RawImageBuffer)                     │
//! └───────┼──────────────────────────────────────────────────┘
//!         ↕ Result<T, AppError> / DegradeCommandError
//! ┌───────┼──────────────────────────────────────────────────┐
//! │       ↕            核心 (Rust)                           │
//! │                                                          │
//! │  ┌─ error ────── AppError (统一错误类型)                  │
//! │  │                                                       │
//! │  ├─ degrade ──── 降质流水线                               │
//! │  │   ├─ lifecycle   引擎加载 / 就绪门禁 / 释放            │
//! │  │   ├─ handler     写入 → 执行 → 读回 → 清理 → 发布      │
//! │  │   ├─ store       ViewState + reducer (watch 广播)     │
//! │  │   └─ engine      内置引擎 / 外部 ffmpeg                │
//! │  │                                                       │
//! │  ├─ settings       JSON 设置文件 → DegradeConfig         │
//! │  └─ storage        结果落盘路径 (返回 Result)             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 统一错误类型 `AppError`，CLI 与宿主的返回类型 |
//! | [`degrade`] | 输入归一、引擎生命周期、降质编排、结果状态 |
//! | [`settings`] | 设置文件的发现、解析与覆盖 |
//! | [`storage`] | 输出目录的获取、自动创建与结果写入 |

pub mod degrade;
pub mod error;
pub mod settings;
pub mod storage;
