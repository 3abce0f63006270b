//! # 数据源与中间模型
//!
//! ## 设计思路
//!
//! 将“外部输入类型”和“流水线中间结果”解耦：
//! - `ImageSource` 表示外部来源语义（文件选择 / 拖放 / 粘贴 / 网络）
//! - `RawImageBuffer` 表示已加载、已嗅探类型但未解码的字节

use bytes::Bytes;

/// 图片输入来源。
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// 本地文件路径（文件选择器或拖放）。
    FilePath(String),
    /// Data URL 或纯 Base64 字符串（网页粘贴、内联拖放）。
    DataUrl(String),
    /// 网络地址（拖入远程图片）。
    Url(String),
    /// 系统剪贴板中的位图。
    Clipboard,
    /// 调用方已持有的原始字节。
    Bytes(Bytes),
}

impl ImageSource {
    /// 根据命令行风格的字符串推断来源。
    ///
    /// `http(s)://` 视为网络地址，`data:` 视为 Data URL，其余按本地路径处理。
    pub fn from_cli_arg(arg: &str) -> Self {
        let trimmed = arg.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Self::Url(trimmed.to_string())
        } else if lower.starts_with("data:") {
            Self::DataUrl(trimmed.to_string())
        } else {
            Self::FilePath(trimmed.to_string())
        }
    }

    /// 来源提示（用于日志与诊断）。
    pub fn hint(&self) -> &'static str {
        match self {
            Self::FilePath(_) => "file",
            Self::DataUrl(_) => "data-url",
            Self::Url(_) => "url",
            Self::Clipboard => "clipboard",
            Self::Bytes(_) => "bytes",
        }
    }
}

/// 加载阶段输出：不可变原始字节 + 嗅探得到的 MIME 类型。
///
/// 每次调用被流水线消费一次，写入引擎虚拟文件系统时复制。
#[derive(Debug, Clone)]
pub struct RawImageBuffer {
    pub(crate) bytes: Bytes,
    pub(crate) mime: &'static str,
    pub(crate) source_hint: &'static str,
}

impl RawImageBuffer {
    /// 由原始字节构造，MIME 类型由文件签名推断。
    ///
    /// 无法识别时记为 `application/octet-stream`，交由流水线在校验阶段拒绝。
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let mime = sniff_mime(&bytes);
        Self {
            bytes,
            mime,
            source_hint: "bytes",
        }
    }

    pub(crate) fn with_hint(bytes: Bytes, source_hint: &'static str) -> Self {
        let mime = sniff_mime(&bytes);
        Self {
            bytes,
            mime,
            source_hint,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn mime(&self) -> &'static str {
        self.mime
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// 写入虚拟文件系统时使用的扩展名。
    pub(crate) fn extension(&self) -> &'static str {
        match self.mime {
            "image/jpeg" => "jpg",
            "image/gif" => "gif",
            "image/webp" => "webp",
            "image/bmp" => "bmp",
            "image/tiff" => "tiff",
            _ => "png",
        }
    }
}

/// 图片像素尺寸（仅读取 header 获得）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

impl ImageDimensions {
    pub fn pixels(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

pub(crate) fn sniff_mime(bytes: &[u8]) -> &'static str {
    infer::get(bytes)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Image)
        .map(|kind| kind.mime_type())
        .unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_arg_is_classified_by_prefix() {
        assert!(matches!(ImageSource::from_cli_arg("https://a.b/c.png"), ImageSource::Url(_)));
        assert!(matches!(
            ImageSource::from_cli_arg("data:image/png;base64,AAAA"),
            ImageSource::DataUrl(_)
        ));
        assert!(matches!(ImageSource::from_cli_arg("./cat.jpg"), ImageSource::FilePath(_)));
    }

    #[test]
    fn raw_buffer_sniffs_png_signature() {
        let png_signature = vec![137_u8, 80, 78, 71, 13, 10, 26, 10, 0, 0, 0, 13, 73, 72, 68, 82];
        let raw = RawImageBuffer::new(png_signature);
        assert_eq!(raw.mime(), "image/png");
        assert_eq!(raw.extension(), "png");
    }

    #[test]
    fn raw_buffer_marks_unknown_payload() {
        let raw = RawImageBuffer::new(b"hello world".to_vec());
        assert_eq!(raw.mime(), "application/octet-stream");
        assert!(!raw.is_empty());
    }
}
