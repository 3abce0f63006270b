//! # 表情包降质工具 — 命令行入口
//!
//! 本文件仅负责日志初始化、参数解析与命令分发。
//! 业务逻辑分布在各子模块中，详见 `lib.rs` 架构文档。
//!
//! ```bash
//! # 默认强度降质本地图片，结果写到当前目录
//! meme-degrader cat.jpg
//!
//! # 三轮降质网络图片，指定输出文件
//! meme-degrader https://example.com/cat.png --strategy triple -o out.png
//!
//! # 读取剪贴板，使用外部 ffmpeg，JSON 输出
//! meme-degrader --paste --engine ffmpeg --json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use serde::Serialize;

use meme_degrader::degrade::commands::{DegradeCommandError, DegradeResultPayload};
use meme_degrader::degrade::{
    DegradationStrategy, DegradeConfig, DegradeError, DegradeServiceState, EngineKind, ImageSource,
};
use meme_degrader::error::AppError;
use meme_degrader::settings::AppSettings;
use meme_degrader::storage::{self, SavedResult};

/// Degrade an image into a deep-fried meme
#[derive(Parser, Debug)]
#[command(name = "meme-degrader")]
#[command(version, about, long_about = None)]
struct Args {
    /// Image path, http(s) URL or data URL
    input: Option<String>,

    /// Read the image from the system clipboard
    #[arg(long, conflicts_with = "input")]
    paste: bool,

    /// Degradation amount (>= 1); defaults to the configured amount
    #[arg(short, long)]
    amount: Option<u32>,

    /// Degradation strategy: single | triple
    #[arg(long)]
    strategy: Option<String>,

    /// Engine implementation: native | ffmpeg
    #[arg(long)]
    engine: Option<String>,

    /// Path of the ffmpeg executable (ffmpeg engine only)
    #[arg(long)]
    ffmpeg_path: Option<PathBuf>,

    /// JSON settings file (falls back to $MEME_DEGRADER_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output file or directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print a JSON payload instead of the output path
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum CliReport {
    Ok {
        result: DegradeResultPayload,
        saved: SavedResult,
    },
    Error {
        error: DegradeCommandError,
    },
}

fn build_config(args: &Args, settings: &AppSettings) -> Result<DegradeConfig, AppError> {
    let mut config = DegradeConfig::default();
    settings.apply_to(&mut config)?;

    if let Some(strategy) = &args.strategy {
        config.strategy = DegradationStrategy::from_str(strategy)?;
    }
    if let Some(engine) = &args.engine {
        config.engine = EngineKind::from_str(engine)?;
    }
    if let Some(path) = &args.ffmpeg_path {
        config.ffmpeg_path = path.clone();
    }

    config.validate()?;
    Ok(config)
}

fn input_source(args: &Args) -> Result<ImageSource, AppError> {
    if args.paste {
        return Ok(ImageSource::Clipboard);
    }
    match &args.input {
        Some(input) => Ok(ImageSource::from_cli_arg(input)),
        None => Err(DegradeError::InvalidInput("需要输入图片路径 / URL，或使用 --paste".to_string()).into()),
    }
}

async fn run(args: &Args) -> Result<(DegradeResultPayload, SavedResult), AppError> {
    let settings = AppSettings::load(args.config.as_deref())?;
    let config = build_config(args, &settings)?;
    let source = input_source(args)?;

    log::info!(
        "🚀 启动 - engine={} strategy={} source={}",
        config.engine.as_str(),
        config.strategy.as_str(),
        source.hint()
    );

    let service = DegradeServiceState::with_config(config)?;
    service.initialize_engine().await?;

    let input_name = match &source {
        ImageSource::FilePath(path) => Some(path.clone()),
        _ => None,
    };

    let outcome = service.process_source(source, args.amount).await;
    let saved = match outcome {
        Ok(handle) => storage::resolve_output_path(
            args.output.as_deref(),
            settings.output_dir.as_deref(),
            input_name.as_deref(),
            &handle,
        )
        .and_then(|path| storage::save_result(&path, &handle))
        .map(|saved| (DegradeResultPayload::from(&handle), saved)),
        Err(err) => Err(err.into()),
    };

    service.teardown().await;
    saved
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(err) => log::error!("JSON 序列化失败: {}", err),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match run(&args).await {
        Ok((result, saved)) => {
            if args.json {
                print_json(&CliReport::Ok { result, saved });
            } else {
                println!("{}", saved.path);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            let code = err.exit_code();
            if args.json {
                let error = match err {
                    AppError::Degrade(inner) => DegradeCommandError::from(inner),
                    other => DegradeCommandError {
                        code: "E_APP",
                        stage: "app",
                        message: other.to_string(),
                        retryable: false,
                    },
                };
                print_json(&CliReport::Error { error });
            } else {
                eprintln!("❌ {}", err);
            }
            ExitCode::from(code as u8)
        }
    }
}
