//! 结果句柄：把输出字节包装成可解引用的 URL。

use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::source::{ImageDimensions, sniff_mime};

/// 结果 URL 前缀。
pub const RESULT_URL_SCHEME: &str = "blob:meme-degrader/";

/// 一次成功降质的产物。
///
/// 字节通过 `Bytes` 共享，`ResultStore::clear()` 之后，仍持有句柄的展示层可继续使用。
#[derive(Debug, Clone)]
pub struct ResultHandle {
    seq: u64,
    url: String,
    output_name: String,
    bytes: Bytes,
    mime: &'static str,
    dimensions: Option<ImageDimensions>,
    created_at: DateTime<Utc>,
}

impl PartialEq for ResultHandle {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq && self.url == other.url
    }
}

impl ResultHandle {
    pub(crate) fn new(
        seq: u64,
        output_name: &str,
        bytes: Bytes,
        dimensions: Option<ImageDimensions>,
    ) -> Self {
        let mime = match sniff_mime(&bytes) {
            "application/octet-stream" => "image/png",
            other => other,
        };
        Self {
            seq,
            url: format!("{}{}", RESULT_URL_SCHEME, output_name),
            output_name: output_name.to_string(),
            bytes,
            mime,
            dimensions,
            created_at: Utc::now(),
        }
    }

    /// 调用序号（单调递增，用于判断新旧）。
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// 解引用：取得输出字节。
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn mime(&self) -> &'static str {
        self.mime
    }

    pub fn dimensions(&self) -> Option<ImageDimensions> {
        self.dimensions
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// 生成可直接嵌入网页的 Data URL。
    pub fn data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime,
            general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_url_embeds_output_name() {
        let handle = ResultHandle::new(7, "1-FILE-abc.png", Bytes::from_static(b"xyz"), None);
        assert_eq!(handle.url(), "blob:meme-degrader/1-FILE-abc.png");
        assert_eq!(handle.seq(), 7);
        assert_eq!(handle.mime(), "image/png");
        assert_eq!(handle.data_url(), "data:image/png;base64,eHl6");
    }
}
