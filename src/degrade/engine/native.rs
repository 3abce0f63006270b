//! # 内置图像引擎
//!
//! ## 设计思路
//!
//! 用纯 Rust 实现流水线真正需要的 ffmpeg 子集，免去外部二进制依赖：
//! - 虚拟文件系统：进程内 `HashMap<String, Bytes>`
//! - 参数：`-i` / `-vf` / `-q:v` / 输出文件名（`-y`、`-hide_banner`、`-nostdin` 忽略）
//! - 滤镜：`scale=W:H[:flags=..]`（整数或 `iw`/`ih` 乘除表达式）、`format=yuv420p|rgb24|rgba`
//! - 输出：按扩展名编码 PNG 或 JPEG
//!
//! ## 实现思路
//!
//! 参数错误直接返回 `EngineError::InvalidArgs`；运行期失败（找不到输入、解码失败、
//! 滤镜不支持）与 ffmpeg 一致：写错误日志、返回非零退出码、不产出文件。
//! 像素计算放在 `spawn_blocking` 中，避免阻塞 async 运行时。

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use fast_image_resize as fr;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageFormat, RgbaImage};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::broadcast;

use super::{
    Engine, EngineError, EngineLogEvent, LOG_CHANNEL_CAPACITY, validate_virtual_name,
};

static DIMENSION_EXPR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(iw|ih)(?:\s*([*/])\s*([0-9]*\.?[0-9]+))?$").expect("valid dimension regex")
});

/// ffmpeg 的 mjpeg qscale 上限。
const MAX_QSCALE: u32 = 31;

/// 单帧像素上限（缩放目标超过时拒绝执行）。
const DEFAULT_MAX_FRAME_PIXELS: u64 = 40_000_000;

/// 内置引擎。
pub struct NativeEngine {
    loaded: AtomicBool,
    files: Mutex<HashMap<String, Bytes>>,
    logs: broadcast::Sender<EngineLogEvent>,
    max_frame_pixels: u64,
}

impl Default for NativeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEngine {
    pub fn new() -> Self {
        let (logs, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            loaded: AtomicBool::new(false),
            files: Mutex::new(HashMap::new()),
            logs,
            max_frame_pixels: DEFAULT_MAX_FRAME_PIXELS,
        }
    }

    /// 调整单帧像素上限。
    pub fn with_max_frame_pixels(mut self, max_frame_pixels: u64) -> Self {
        self.max_frame_pixels = max_frame_pixels;
        self
    }

    fn ensure_loaded(&self) -> Result<(), EngineError> {
        if self.loaded.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::NotLoaded)
        }
    }

    fn files(&self) -> Result<MutexGuard<'_, HashMap<String, Bytes>>, EngineError> {
        self.files
            .lock()
            .map_err(|_| EngineError::Exec("虚拟文件表锁已中毒".to_string()))
    }

    fn emit(&self, event: EngineLogEvent) {
        // 没有订阅者时发送失败属于正常情况
        let _ = self.logs.send(event);
    }
}

#[async_trait]
impl Engine for NativeEngine {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn load(&self) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        self.loaded.store(true, Ordering::SeqCst);
        self.emit(EngineLogEvent::info("native engine loaded"));
        Ok(())
    }

    async fn write_file(&self, name: &str, bytes: Bytes) -> Result<(), EngineError> {
        self.ensure_loaded()?;
        validate_virtual_name(name)?;
        self.files()?.insert(name.to_string(), bytes);
        Ok(())
    }

    async fn exec(&self, argv: &[String]) -> Result<i32, EngineError> {
        self.ensure_loaded()?;
        let args = ExecArgs::parse(argv)?;
        validate_virtual_name(&args.input)?;
        validate_virtual_name(&args.output)?;

        let stored = self.files()?.get(&args.input).cloned();
        let input = match stored {
            Some(bytes) => bytes,
            None => {
                self.emit(EngineLogEvent::error(format!(
                    "{}: No such file or directory",
                    args.input
                )));
                return Ok(1);
            }
        };

        let job_args = args.clone();
        let max_pixels = self.max_frame_pixels;
        let outcome = tokio::task::spawn_blocking(move || run_job(&input, &job_args, max_pixels))
            .await
            .map_err(|e| EngineError::Exec(format!("执行线程失败：{}", e)))?;

        match outcome {
            Ok(job) => {
                for line in job.log_lines {
                    self.emit(EngineLogEvent::info(line));
                }
                self.files()?.insert(args.output.clone(), Bytes::from(job.output));
                Ok(0)
            }
            Err(message) => {
                self.emit(EngineLogEvent::error(message));
                Ok(1)
            }
        }
    }

    async fn read_file(&self, name: &str) -> Result<Bytes, EngineError> {
        self.ensure_loaded()?;
        validate_virtual_name(name)?;
        self.files()?
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::FileNotFound(name.to_string()))
    }

    async fn delete_file(&self, name: &str) -> Result<(), EngineError> {
        self.ensure_loaded()?;
        validate_virtual_name(name)?;
        self.files()?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::FileNotFound(name.to_string()))
    }

    async fn list_files(&self) -> Result<Vec<String>, EngineError> {
        self.ensure_loaded()?;
        let mut names: Vec<String> = self.files()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn subscribe_logs(&self) -> broadcast::Receiver<EngineLogEvent> {
        self.logs.subscribe()
    }
}

// ----------------------------------------------------------------------------
// 参数解析
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ExecArgs {
    input: String,
    filters: Vec<Filter>,
    qscale: Option<u32>,
    output: String,
}

impl ExecArgs {
    fn parse(argv: &[String]) -> Result<Self, EngineError> {
        let mut input = None;
        let mut chain = None;
        let mut qscale = None;
        let mut output = None;

        let mut iter = argv.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-i" => input = Some(next_value(&mut iter, "-i")?),
                "-vf" | "-filter:v" => chain = Some(next_value(&mut iter, "-vf")?),
                "-q:v" | "-qscale:v" => {
                    let raw = next_value(&mut iter, "-q:v")?;
                    let value = raw
                        .parse::<u32>()
                        .map_err(|_| EngineError::InvalidArgs(format!("-q:v 不是整数：{}", raw)))?;
                    qscale = Some(value);
                }
                "-y" | "-hide_banner" | "-nostdin" => {}
                flag if flag.starts_with('-') => {
                    return Err(EngineError::InvalidArgs(format!("不支持的参数：{}", flag)));
                }
                positional => output = Some(positional.to_string()),
            }
        }

        let filters = match chain {
            Some(chain) => parse_filter_chain(&chain)?,
            None => Vec::new(),
        };

        Ok(Self {
            input: input.ok_or_else(|| EngineError::InvalidArgs("缺少 -i 输入".to_string()))?,
            filters,
            qscale,
            output: output.ok_or_else(|| EngineError::InvalidArgs("缺少输出文件名".to_string()))?,
        })
    }
}

fn next_value<'a>(
    iter: &mut impl Iterator<Item = &'a String>,
    flag: &str,
) -> Result<String, EngineError> {
    iter.next()
        .cloned()
        .ok_or_else(|| EngineError::InvalidArgs(format!("{} 缺少参数值", flag)))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Axis {
    Width,
    Height,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Dimension {
    Fixed(u32),
    Relative { axis: Axis, factor: f64 },
}

impl Dimension {
    fn parse(raw: &str) -> Result<Self, EngineError> {
        let raw = raw.trim();
        if let Ok(value) = raw.parse::<u32>() {
            if value == 0 {
                return Err(EngineError::InvalidArgs("scale 尺寸不能为 0".to_string()));
            }
            return Ok(Self::Fixed(value));
        }

        let captures = DIMENSION_EXPR
            .captures(raw)
            .ok_or_else(|| EngineError::InvalidArgs(format!("无法解析尺寸表达式：{}", raw)))?;
        let axis = if &captures[1] == "iw" { Axis::Width } else { Axis::Height };
        let factor = match (captures.get(2), captures.get(3)) {
            (Some(op), Some(value)) => {
                let value: f64 = value
                    .as_str()
                    .parse()
                    .map_err(|_| EngineError::InvalidArgs(format!("无法解析尺寸系数：{}", raw)))?;
                if value <= 0.0 {
                    return Err(EngineError::InvalidArgs(format!("尺寸系数必须为正：{}", raw)));
                }
                if op.as_str() == "*" { value } else { 1.0 / value }
            }
            _ => 1.0,
        };
        Ok(Self::Relative { axis, factor })
    }

    fn resolve(self, width: u32, height: u32) -> u32 {
        match self {
            Self::Fixed(value) => value,
            Self::Relative { axis, factor } => {
                let base = match axis {
                    Axis::Width => width,
                    Axis::Height => height,
                };
                ((base as f64 * factor).floor() as u32).max(1)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScaleFlags {
    Bilinear,
    Bicubic,
    Lanczos,
    Neighbor,
    Area,
}

impl ScaleFlags {
    fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw {
            "bilinear" | "fast_bilinear" => Ok(Self::Bilinear),
            "bicubic" => Ok(Self::Bicubic),
            "lanczos" => Ok(Self::Lanczos),
            "neighbor" => Ok(Self::Neighbor),
            "area" => Ok(Self::Area),
            other => Err(EngineError::InvalidArgs(format!("不支持的缩放算法：{}", other))),
        }
    }

    fn to_resize_alg(self) -> fr::ResizeAlg {
        match self {
            Self::Bilinear => fr::ResizeAlg::Convolution(fr::FilterType::Bilinear),
            Self::Bicubic => fr::ResizeAlg::Convolution(fr::FilterType::CatmullRom),
            Self::Lanczos => fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3),
            Self::Area => fr::ResizeAlg::Convolution(fr::FilterType::Box),
            Self::Neighbor => fr::ResizeAlg::Nearest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    Yuv420p,
    Rgb24,
    Rgba,
}

#[derive(Debug, Clone, PartialEq)]
enum Filter {
    Scale {
        width: Dimension,
        height: Dimension,
        flags: ScaleFlags,
    },
    Format(PixelFormat),
}

fn parse_filter_chain(chain: &str) -> Result<Vec<Filter>, EngineError> {
    chain
        .split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(parse_filter)
        .collect()
}

fn parse_filter(segment: &str) -> Result<Filter, EngineError> {
    let (name, options) = segment.split_once('=').unwrap_or((segment, ""));
    match name {
        "scale" => {
            let mut positional = Vec::new();
            let mut width = None;
            let mut height = None;
            let mut flags = ScaleFlags::Bilinear;

            for option in options.split(':').filter(|o| !o.is_empty()) {
                match option.split_once('=') {
                    Some(("w" | "width", value)) => width = Some(Dimension::parse(value)?),
                    Some(("h" | "height", value)) => height = Some(Dimension::parse(value)?),
                    Some(("flags", value)) => flags = ScaleFlags::parse(value)?,
                    Some((key, _)) => {
                        return Err(EngineError::InvalidArgs(format!("scale 不支持选项：{}", key)));
                    }
                    None => positional.push(Dimension::parse(option)?),
                }
            }

            let mut positional = positional.into_iter();
            let width = width.or_else(|| positional.next());
            let height = height.or_else(|| positional.next());
            match (width, height) {
                (Some(width), Some(height)) => Ok(Filter::Scale { width, height, flags }),
                _ => Err(EngineError::InvalidArgs(format!("scale 需要宽和高：{}", segment))),
            }
        }
        "format" => match options {
            "yuv420p" => Ok(Filter::Format(PixelFormat::Yuv420p)),
            "rgb24" => Ok(Filter::Format(PixelFormat::Rgb24)),
            "rgba" => Ok(Filter::Format(PixelFormat::Rgba)),
            other => Err(EngineError::InvalidArgs(format!("不支持的像素格式：{}", other))),
        },
        other => Err(EngineError::InvalidArgs(format!("不支持的滤镜：{}", other))),
    }
}

// ----------------------------------------------------------------------------
// 执行
// ----------------------------------------------------------------------------

struct JobOutput {
    output: Vec<u8>,
    log_lines: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum OutputFormat {
    Png,
    Jpeg,
}

impl OutputFormat {
    fn from_name(name: &str) -> Result<Self, String> {
        let ext = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("png") => Ok(Self::Png),
            Some("jpg" | "jpeg") => Ok(Self::Jpeg),
            _ => Err(format!("Unable to choose an output format for '{}'", name)),
        }
    }
}

/// ffmpeg qscale（2 最好，31 最差）到 JPEG 质量的近似映射。
fn jpeg_quality_from_qscale(qscale: u32) -> u8 {
    let q = qscale.clamp(1, MAX_QSCALE);
    (100 - 3 * q).max(1) as u8
}

fn run_job(input: &[u8], args: &ExecArgs, max_pixels: u64) -> Result<JobOutput, String> {
    let format = OutputFormat::from_name(&args.output)?;
    let decoded = image::load_from_memory(input)
        .map_err(|e| format!("{}: Invalid data found when processing input ({})", args.input, e))?;

    let mut log_lines = Vec::new();
    let (width, height) = decoded.dimensions();
    log_lines.push(format!("Input #0, {}x{}, from '{}'", width, height, args.input));

    let mut frame = decoded.to_rgba8();
    for filter in &args.filters {
        match filter {
            Filter::Scale { width, height, flags } => {
                let (w, h) = frame.dimensions();
                let target_w = width.resolve(w, h);
                let target_h = height.resolve(w, h);
                if target_w as u64 * target_h as u64 > max_pixels {
                    return Err(format!(
                        "scale target {}x{} exceeds the frame limit of {} pixels",
                        target_w, target_h, max_pixels
                    ));
                }
                frame = resize(frame, target_w, target_h, *flags)?;
            }
            Filter::Format(PixelFormat::Yuv420p) => subsample_chroma_420(&mut frame),
            Filter::Format(PixelFormat::Rgb24) => drop_alpha(&mut frame),
            Filter::Format(PixelFormat::Rgba) => {}
        }
    }

    let (out_w, out_h) = frame.dimensions();
    let output = encode(frame, format, args.qscale)?;
    log_lines.push(format!(
        "Output #0, {:?}, {}x{}, to '{}' ({} bytes)",
        format,
        out_w,
        out_h,
        args.output,
        output.len()
    ));

    Ok(JobOutput { output, log_lines })
}

fn resize(frame: RgbaImage, width: u32, height: u32, flags: ScaleFlags) -> Result<RgbaImage, String> {
    let (src_width, src_height) = frame.dimensions();
    if (src_width, src_height) == (width, height) {
        return Ok(frame);
    }

    let src_image = fr::images::Image::from_vec_u8(
        src_width,
        src_height,
        frame.into_raw(),
        fr::PixelType::U8x4,
    )
    .map_err(|e| format!("构建源图像缓冲失败：{}", e))?;

    let mut dst_image = fr::images::Image::new(width, height, fr::PixelType::U8x4);
    let mut resizer = fr::Resizer::new();
    let options = fr::ResizeOptions::new().resize_alg(flags.to_resize_alg());

    resizer
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| format!("缩放失败：{}", e))?;

    RgbaImage::from_raw(width, height, dst_image.into_vec())
        .ok_or_else(|| "缩放输出缓冲长度异常".to_string())
}

fn drop_alpha(frame: &mut RgbaImage) {
    for pixel in frame.pixels_mut() {
        pixel.0[3] = 255;
    }
}

fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168736 * r - 0.331264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418688 * g - 0.081312 * b;
    (quantize(y), quantize(cb), quantize(cr))
}

fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let yf = y as f32;
    let cbf = cb as f32 - 128.0;
    let crf = cr as f32 - 128.0;
    [
        quantize(yf + 1.402 * crf),
        quantize(yf - 0.344136 * cbf - 0.714136 * crf),
        quantize(yf + 1.772 * cbf),
    ]
}

fn quantize(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// 4:2:0 色度下采样：每个 2x2 块共享一组平均后的 Cb/Cr，亮度逐像素保留。
///
/// yuv420p 没有 alpha 通道，输出一律不透明。
fn subsample_chroma_420(frame: &mut RgbaImage) {
    let (width, height) = frame.dimensions();
    for block_y in (0..height).step_by(2) {
        for block_x in (0..width).step_by(2) {
            let mut members = [(0u32, 0u32, 0u8); 4];
            let mut count = 0usize;
            let mut cb_sum = 0u32;
            let mut cr_sum = 0u32;

            for y in block_y..(block_y + 2).min(height) {
                for x in block_x..(block_x + 2).min(width) {
                    let [r, g, b, _] = frame.get_pixel(x, y).0;
                    let (luma, cb, cr) = rgb_to_ycbcr(r, g, b);
                    members[count] = (x, y, luma);
                    count += 1;
                    cb_sum += cb as u32;
                    cr_sum += cr as u32;
                }
            }

            let n = count as u32;
            let cb = ((cb_sum + n / 2) / n) as u8;
            let cr = ((cr_sum + n / 2) / n) as u8;
            for &(x, y, luma) in &members[..count] {
                let [r, g, b] = ycbcr_to_rgb(luma, cb, cr);
                frame.put_pixel(x, y, image::Rgba([r, g, b, 255]));
            }
        }
    }
}

fn encode(frame: RgbaImage, format: OutputFormat, qscale: Option<u32>) -> Result<Vec<u8>, String> {
    let mut cursor = Cursor::new(Vec::new());
    match format {
        OutputFormat::Png => {
            DynamicImage::ImageRgba8(frame)
                .write_to(&mut cursor, ImageFormat::Png)
                .map_err(|e| format!("PNG 编码失败：{}", e))?;
        }
        OutputFormat::Jpeg => {
            let quality = jpeg_quality_from_qscale(qscale.unwrap_or(MAX_QSCALE));
            let rgb = DynamicImage::ImageRgba8(frame).to_rgb8();
            DynamicImage::ImageRgb8(rgb)
                .write_with_encoder(JpegEncoder::new_with_quality(&mut cursor, quality))
                .map_err(|e| format!("JPEG 编码失败：{}", e))?;
        }
    }
    Ok(cursor.into_inner())
}
