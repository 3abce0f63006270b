//! # 加载与校验模块
//!
//! ## 设计思路
//!
//! 统一处理不同来源（本地文件 / Data URL / 网络地址 / 剪贴板 / 原始字节）的加载，
//! 全部归一为 `RawImageBuffer`，并在“尽可能早”的阶段执行输入校验。
//! 目标是尽快失败，减少不必要的内存与 CPU 消耗。
//!
//! ## 实现思路
//!
//! - URL：协议 + 主机安全 + 内容类型 + 体积校验 + 流式下载。
//! - Data URL：格式解析 + 解码前体积上限估算。
//! - 文件：存在性 + metadata 体积限制 + 读取。
//! - 剪贴板：阻塞线程读取 RGBA 位图并编码为 PNG。
//! - 网络错误统一映射到 `DegradeError`，便于上层处理。

use std::io::Cursor;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose};
use bytes::{Bytes, BytesMut};
use image::{DynamicImage, ImageFormat, RgbaImage};
use rand::Rng;
use tokio::net::lookup_host;

use super::source::RawImageBuffer;
use super::{DegradeConfig, DegradeError, DegradeHandler, ImageSource};

const STREAM_SIGNATURE_PROBE_BYTES: usize = 4096;
const NETWORK_RETRY_MAX_ATTEMPTS: u8 = 3;
const NETWORK_RETRY_BASE_DELAY_MS: u64 = 180;
const BUFFER_INITIAL_CAPACITY: usize = 16 * 1024;
const MAX_REDIRECTS: u8 = 5;

impl DegradeHandler {
    /// 按来源加载原始字节。
    pub async fn load_source(&self, source: ImageSource) -> Result<RawImageBuffer, DegradeError> {
        let config = self.config_snapshot()?;
        let load_start = Instant::now();
        let hint = source.hint();

        let raw = match source {
            ImageSource::FilePath(path) => Self::load_from_file(&path, &config).await?,
            ImageSource::DataUrl(data) => Self::load_from_data_url(&data, &config)?,
            ImageSource::Url(url) => Self::load_from_url(&url, &config).await?,
            ImageSource::Clipboard => Self::load_from_clipboard(&config).await?,
            ImageSource::Bytes(bytes) => Self::load_from_bytes(bytes, &config)?,
        };

        log::info!(
            "📥 输入加载完成 - source={} mime={} size={}KB load={}ms",
            hint,
            raw.mime(),
            raw.len() / 1024,
            load_start.elapsed().as_millis()
        );

        Ok(raw)
    }

    /// 从本地路径加载图片原始字节。
    pub(super) async fn load_from_file(
        path: &str,
        config: &DegradeConfig,
    ) -> Result<RawImageBuffer, DegradeError> {
        log::info!("📁 开始读取本地图片 - 路径: {}", path);

        let file_path = Path::new(path);
        let metadata = tokio::fs::metadata(file_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DegradeError::FileSystem(format!("文件不存在：{}", path))
            } else {
                DegradeError::FileSystem(format!("无法读取文件信息：{}", e))
            }
        })?;

        if !metadata.is_file() {
            return Err(DegradeError::InvalidInput(format!("不是普通文件：{}", path)));
        }

        if metadata.len() > config.max_input_bytes {
            return Err(DegradeError::ResourceLimit(format!(
                "文件过大：{:.2} MB（限制：{:.2} MB）",
                metadata.len() as f64 / 1024.0 / 1024.0,
                config.max_input_bytes as f64 / 1024.0 / 1024.0
            )));
        }

        let bytes = tokio::fs::read(file_path)
            .await
            .map_err(|e| DegradeError::FileSystem(format!("无法读取图片文件：{}", e)))?;
        Self::validate_image_signature(&bytes)?;

        Ok(RawImageBuffer::with_hint(Bytes::from(bytes), "file"))
    }

    /// 从 Data URL 或纯 Base64 字符串加载。
    pub(super) fn load_from_data_url(
        data: &str,
        config: &DegradeConfig,
    ) -> Result<RawImageBuffer, DegradeError> {
        log::info!("📝 开始处理内联图片数据");

        let bytes = Self::parse_base64_with_limit(data, config.max_input_bytes)?;
        if bytes.len() as u64 > config.max_input_bytes {
            return Err(DegradeError::ResourceLimit(format!(
                "Base64 解码后体积过大：{:.2} MB（限制：{:.2} MB）",
                bytes.len() as f64 / 1024.0 / 1024.0,
                config.max_input_bytes as f64 / 1024.0 / 1024.0
            )));
        }
        Self::validate_image_signature(&bytes)?;

        Ok(RawImageBuffer::with_hint(Bytes::from(bytes), "data-url"))
    }

    /// 直接交付的字节，仅做签名与体积校验。
    pub(super) fn load_from_bytes(
        bytes: Bytes,
        config: &DegradeConfig,
    ) -> Result<RawImageBuffer, DegradeError> {
        if bytes.len() as u64 > config.max_input_bytes {
            return Err(DegradeError::ResourceLimit(format!(
                "图片过大：{:.2} MB",
                bytes.len() as f64 / 1024.0 / 1024.0
            )));
        }
        Self::validate_image_signature(&bytes)?;
        Ok(RawImageBuffer::with_hint(bytes, "bytes"))
    }

    /// 读取系统剪贴板中的位图，编码为 PNG。
    pub(super) async fn load_from_clipboard(
        config: &DegradeConfig,
    ) -> Result<RawImageBuffer, DegradeError> {
        log::info!("📋 开始读取剪贴板图片");

        let max_pixels = config.max_input_pixels;
        let png = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, DegradeError> {
            let mut clipboard = arboard::Clipboard::new()
                .map_err(|e| DegradeError::Clipboard(format!("无法访问剪贴板：{}", e)))?;
            let image = clipboard
                .get_image()
                .map_err(|e| DegradeError::Clipboard(format!("剪贴板中没有可用图片：{}", e)))?;

            let pixels = image.width as u64 * image.height as u64;
            if pixels > max_pixels {
                return Err(DegradeError::ResourceLimit(format!(
                    "剪贴板图片像素过多：{}x{}",
                    image.width, image.height
                )));
            }

            Self::encode_rgba_as_png(image.width as u32, image.height as u32, image.bytes.into_owned())
        })
        .await
        .map_err(|e| DegradeError::Clipboard(format!("线程执行失败：{}", e)))??;

        Ok(RawImageBuffer::with_hint(Bytes::from(png), "clipboard"))
    }

    fn encode_rgba_as_png(width: u32, height: u32, rgba: Vec<u8>) -> Result<Vec<u8>, DegradeError> {
        let buffer = RgbaImage::from_raw(width, height, rgba).ok_or_else(|| {
            DegradeError::Clipboard(format!("剪贴板位图长度与尺寸不符：{}x{}", width, height))
        })?;

        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(buffer)
            .write_to(&mut cursor, ImageFormat::Png)
            .map_err(|e| DegradeError::Clipboard(format!("剪贴板图片编码失败：{}", e)))?;
        Ok(cursor.into_inner())
    }

    /// 从 URL 下载图片原始字节。
    pub(super) async fn load_from_url(
        url: &str,
        config: &DegradeConfig,
    ) -> Result<RawImageBuffer, DegradeError> {
        log::info!("🌐 开始下载图片 - URL: {}", Self::redact_url_for_log(url));

        Self::validate_url_safety(url, config).await?;
        let bytes = Self::download_with_validation(url, config).await?;
        Self::validate_image_signature(&bytes)?;

        Ok(RawImageBuffer::with_hint(bytes, "url"))
    }

    /// 执行带校验的网络下载。
    ///
    /// 手动跟随重定向，每一跳都重新做安全校验；使用流式读取，超过上限立即中止。
    async fn download_with_validation(
        url: &str,
        config: &DegradeConfig,
    ) -> Result<Bytes, DegradeError> {
        let client = Self::build_http_client(config)?;
        let mut current_url = reqwest::Url::parse(url)
            .map_err(|e| DegradeError::InvalidInput(format!("URL 格式错误：{}", e)))?;

        for redirect_count in 0..=MAX_REDIRECTS {
            let response = Self::send_with_retry(&client, &current_url, config).await?;

            if response.status().is_redirection() {
                if redirect_count >= MAX_REDIRECTS {
                    return Err(DegradeError::Network(format!(
                        "重定向次数超过限制（{}）",
                        MAX_REDIRECTS
                    )));
                }

                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .ok_or_else(|| DegradeError::Network("重定向响应缺少 Location 头".to_string()))?
                    .to_str()
                    .map_err(|e| DegradeError::InvalidInput(format!("重定向地址无效：{}", e)))?;

                let next_url = current_url
                    .join(location)
                    .map_err(|e| DegradeError::InvalidInput(format!("重定向 URL 解析失败：{}", e)))?;

                Self::validate_url_safety(next_url.as_str(), config).await?;

                log::debug!("↪️ 跳转到: {}", Self::redact_url_for_log(next_url.as_str()));
                current_url = next_url;
                continue;
            }

            if !response.status().is_success() {
                return Err(DegradeError::Network(format!(
                    "HTTP {}: {}",
                    response.status().as_u16(),
                    Self::status_message(response.status().as_u16())
                )));
            }

            if let Some(ct) = response.headers().get(reqwest::header::CONTENT_TYPE) {
                if let Ok(ct_str) = ct.to_str() {
                    if !Self::is_image_content_type(ct_str) {
                        return Err(DegradeError::InvalidInput(format!("不是图片类型：{}", ct_str)));
                    }
                }
            }

            let total_len = response.content_length();
            if let Some(size) = total_len {
                if size > config.max_input_bytes {
                    return Err(DegradeError::ResourceLimit(format!(
                        "文件过大：{:.2} MB（限制：{:.2} MB）",
                        size as f64 / 1024.0 / 1024.0,
                        config.max_input_bytes as f64 / 1024.0 / 1024.0
                    )));
                }
            }

            return Self::read_body_with_limit(response, total_len, config).await;
        }

        Err(DegradeError::Network("下载流程异常结束".to_string()))
    }

    async fn read_body_with_limit(
        mut response: reqwest::Response,
        total_len: Option<u64>,
        config: &DegradeConfig,
    ) -> Result<Bytes, DegradeError> {
        let initial_capacity = total_len
            .map(|len| len.min(config.max_input_bytes).min(usize::MAX as u64) as usize)
            .filter(|len| *len > 0)
            .unwrap_or(BUFFER_INITIAL_CAPACITY);
        let mut buffer = BytesMut::with_capacity(initial_capacity);
        let mut signature_validated = false;
        let chunk_timeout = Duration::from_secs(config.download_timeout);

        loop {
            let next_chunk = tokio::time::timeout(chunk_timeout, response.chunk())
                .await
                .map_err(|_| DegradeError::Timeout("下载数据流读取超时".to_string()))?
                .map_err(|e| DegradeError::Network(format!("下载失败：{}", e)))?;

            let Some(chunk) = next_chunk else {
                break;
            };

            if buffer.len() as u64 + chunk.len() as u64 > config.max_input_bytes {
                return Err(DegradeError::ResourceLimit("下载后文件超过大小限制".to_string()));
            }
            buffer.extend_from_slice(&chunk);

            if !signature_validated {
                signature_validated =
                    Self::validate_stream_signature_probe(&buffer, STREAM_SIGNATURE_PROBE_BYTES)?;
            }
        }

        if !signature_validated {
            Self::validate_image_signature(&buffer)?;
        }

        log::debug!("✅ 下载完成 - {} bytes", buffer.len());
        Ok(buffer.freeze())
    }

    async fn send_with_retry(
        client: &reqwest::Client,
        url: &reqwest::Url,
        config: &DegradeConfig,
    ) -> Result<reqwest::Response, DegradeError> {
        let mut attempt: u8 = 1;
        loop {
            match client
                .get(url.clone())
                .header(reqwest::header::ACCEPT, "image/avif,image/webp,image/apng,image/*,*/*;q=0.8")
                .send()
                .await
            {
                Ok(resp) => {
                    if attempt < NETWORK_RETRY_MAX_ATTEMPTS
                        && Self::is_retryable_http_status(resp.status())
                    {
                        let delay_ms = Self::compute_retry_delay_with_jitter(attempt);
                        log::warn!(
                            "⚠️ HTTP {}（第 {}/{} 次，可重试）；{}ms 后重试",
                            resp.status().as_u16(),
                            attempt,
                            NETWORK_RETRY_MAX_ATTEMPTS,
                            delay_ms
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt >= NETWORK_RETRY_MAX_ATTEMPTS || !(err.is_timeout() || err.is_connect()) {
                        return Err(Self::map_reqwest_error(err, url.as_str(), config));
                    }

                    let delay_ms = Self::compute_retry_delay_with_jitter(attempt);
                    log::warn!(
                        "⚠️ 网络请求失败（第 {}/{} 次，可重试）：{}；{}ms 后重试",
                        attempt,
                        NETWORK_RETRY_MAX_ATTEMPTS,
                        Self::sanitize_error_message(&err.to_string(), url.as_str()),
                        delay_ms
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    fn build_http_client(config: &DegradeConfig) -> Result<reqwest::Client, DegradeError> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download_timeout))
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DegradeError::Network(format!("无法创建 HTTP 客户端：{}", e)))
    }

    fn compute_retry_delay_with_jitter(attempt: u8) -> u64 {
        let base = NETWORK_RETRY_BASE_DELAY_MS
            .saturating_mul(1_u64 << (attempt.saturating_sub(1) as u32));
        let jitter = rand::rng().random_range(0..=base / 2);
        base.saturating_add(jitter)
    }

    fn is_retryable_http_status(status: reqwest::StatusCode) -> bool {
        status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
    }

    fn is_image_content_type(content_type: &str) -> bool {
        content_type
            .split(';')
            .next()
            .map(|base| base.trim().to_ascii_lowercase().starts_with("image/"))
            .unwrap_or(false)
    }

    fn redact_url_for_log(url: &str) -> String {
        let Ok(parsed) = reqwest::Url::parse(url) else {
            return "<invalid-url>".to_string();
        };

        let host = parsed.host_str().unwrap_or("<unknown-host>");
        let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();

        format!("{}://{}{}{}", parsed.scheme(), host, port, parsed.path())
    }

    fn sanitize_error_message(error_msg: &str, url: &str) -> String {
        error_msg.replace(url, &Self::redact_url_for_log(url))
    }

    fn map_reqwest_error(e: reqwest::Error, url: &str, config: &DegradeConfig) -> DegradeError {
        let err_msg = Self::sanitize_error_message(&e.to_string(), url);

        if e.is_timeout() {
            DegradeError::Timeout(format!("下载超时（{}秒）", config.download_timeout))
        } else if e.is_connect() {
            DegradeError::Network(format!("无法连接：{}", err_msg))
        } else {
            DegradeError::Network(format!("请求失败：{}", err_msg))
        }
    }

    /// 常见 HTTP 状态码本地化文案。
    fn status_message(code: u16) -> &'static str {
        match code {
            404 => "未找到",
            403 => "访问被拒绝",
            500..=599 => "服务器错误",
            _ => "请求失败",
        }
    }

    /// 校验 URL 安全性。
    ///
    /// 默认阻止本地/内网目标（含解析后落在内网的域名）。
    async fn validate_url_safety(url: &str, config: &DegradeConfig) -> Result<(), DegradeError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| DegradeError::InvalidInput(format!("URL 格式错误：{}", e)))?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(DegradeError::InvalidInput("仅支持 HTTP/HTTPS".to_string()));
        }

        if config.allow_private_network {
            return Ok(());
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| DegradeError::InvalidInput("URL 缺少主机地址".to_string()))?;

        if Self::is_local_hostname(host) {
            return Err(DegradeError::InvalidInput(format!("禁止访问本地网络地址：{}", host)));
        }

        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare_host.parse::<IpAddr>() {
            if Self::is_private_or_local_ip(ip) {
                return Err(DegradeError::InvalidInput(format!("禁止访问内网 IP：{}", ip)));
            }
            return Ok(());
        }

        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| DegradeError::InvalidInput("URL 缺少端口信息".to_string()))?;
        let addrs = lookup_host((host, port))
            .await
            .map_err(|e| DegradeError::Network(format!("URL 主机解析失败：{}", e)))?;

        for addr in addrs {
            if Self::is_private_or_local_ip(addr.ip()) {
                return Err(DegradeError::InvalidInput(format!(
                    "URL 解析结果命中内网地址：{}",
                    addr.ip()
                )));
            }
        }

        Ok(())
    }

    fn is_local_hostname(host: &str) -> bool {
        host.eq_ignore_ascii_case("localhost")
            || host.eq_ignore_ascii_case("localhost.")
            || host.ends_with(".local")
    }

    /// 判断 IP 是否属于本地/内网/链路本地等受限范围。
    fn is_private_or_local_ip(ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                if v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_documentation()
                    || v4.is_unspecified()
                    || v4.is_multicast()
                {
                    return true;
                }

                let octets = v4.octets();
                octets[0] == 0 || (octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000)
            }
            IpAddr::V6(v6) => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || v6.is_unique_local()
                    || v6.is_unicast_link_local()
                    || v6.is_multicast()
            }
        }
    }

    fn estimate_base64_decoded_upper_bound_len(base64_data: &str) -> Result<u64, DegradeError> {
        let len = base64_data.trim().len() as u64;
        let groups = len
            .checked_add(3)
            .ok_or_else(|| DegradeError::ResourceLimit("Base64 输入长度溢出".to_string()))?
            / 4;

        groups
            .checked_mul(3)
            .ok_or_else(|| DegradeError::ResourceLimit("Base64 解码体积估算溢出".to_string()))
    }

    /// 解析 Base64 输入（支持 Data URL / 纯 Base64），解码前先按上限估算体积。
    fn parse_base64_with_limit(data: &str, max_bytes: u64) -> Result<Vec<u8>, DegradeError> {
        let normalized = data.trim();

        let is_data_url = normalized
            .get(..5)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("data:"));
        let payload = if is_data_url {
            let marker = normalized
                .find(";base64,")
                .ok_or_else(|| DegradeError::InvalidInput("缺少 base64 标记".to_string()))?;
            let media_type = &normalized[5..marker];
            if !media_type.to_ascii_lowercase().starts_with("image/") {
                return Err(DegradeError::InvalidInput(format!(
                    "Data URL 不是图片类型：{}",
                    media_type
                )));
            }
            &normalized[marker + 8..]
        } else {
            normalized
        };

        let estimated_len = Self::estimate_base64_decoded_upper_bound_len(payload)?;
        if estimated_len > max_bytes {
            return Err(DegradeError::ResourceLimit(format!(
                "Base64 预计解码体积过大：{:.2} MB（限制：{:.2} MB）",
                estimated_len as f64 / 1024.0 / 1024.0,
                max_bytes as f64 / 1024.0 / 1024.0
            )));
        }

        general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| DegradeError::InvalidInput(format!("Base64 解码失败：{}", e)))
    }

    /// 通过文件签名（magic bytes）校验输入是否为图片。
    fn validate_image_signature(bytes: &[u8]) -> Result<(), DegradeError> {
        if bytes.is_empty() {
            return Err(DegradeError::InvalidInput("图片内容为空".to_string()));
        }

        let kind = infer::get(bytes)
            .ok_or_else(|| DegradeError::InvalidInput("无法识别图片类型".to_string()))?;

        if kind.matcher_type() != infer::MatcherType::Image {
            return Err(DegradeError::InvalidInput(format!(
                "文件签名不是图片类型：{}",
                kind.mime_type()
            )));
        }

        Ok(())
    }

    /// 流式下载阶段的签名探测。
    ///
    /// - `Ok(true)`：已识别为图片
    /// - `Ok(false)`：字节不足以判断，继续下载
    /// - `Err(...)`：已识别为非图片，或达到探测上限仍无法识别
    fn validate_stream_signature_probe(bytes: &[u8], probe_limit: usize) -> Result<bool, DegradeError> {
        if bytes.is_empty() {
            return Ok(false);
        }

        if let Some(kind) = infer::get(bytes) {
            if kind.matcher_type() != infer::MatcherType::Image {
                return Err(DegradeError::InvalidInput(format!(
                    "下载内容不是图片类型：{}",
                    kind.mime_type()
                )));
            }
            return Ok(true);
        }

        if bytes.len() >= probe_limit {
            return Err(DegradeError::InvalidInput(format!(
                "下载前 {} 字节内无法识别图片类型",
                probe_limit
            )));
        }

        Ok(false)
    }
}
