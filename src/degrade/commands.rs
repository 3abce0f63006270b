//! # 命令层
//!
//! ## 设计思路
//!
//! 命令层仅做入参适配与可序列化的结果返回，不承载业务逻辑。
//! 所有实际处理交由 `DegradeServiceState`，保持命令函数薄、稳定、易测试。

use serde::Serialize;

use super::service::DegradeServiceState;
use super::{DegradeError, ImageSource, ResultHandle, ViewState};

#[derive(Debug, Clone, Serialize)]
pub struct DegradeCommandError {
    pub code: &'static str,
    pub stage: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl From<DegradeError> for DegradeCommandError {
    fn from(error: DegradeError) -> Self {
        Self {
            code: error.code(),
            stage: error.stage(),
            retryable: error.is_retryable(),
            message: error.to_string(),
        }
    }
}

/// 一次降质的对外结果。
#[derive(Debug, Clone, Serialize)]
pub struct DegradeResultPayload {
    pub seq: u64,
    pub url: String,
    pub output_name: String,
    pub mime: &'static str,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub size_bytes: usize,
    /// RFC 3339 时间戳。
    pub created_at: String,
}

impl From<&ResultHandle> for DegradeResultPayload {
    fn from(handle: &ResultHandle) -> Self {
        let dims = handle.dimensions();
        Self {
            seq: handle.seq(),
            url: handle.url().to_string(),
            output_name: handle.output_name().to_string(),
            mime: handle.mime(),
            width: dims.map(|d| d.width),
            height: dims.map(|d| d.height),
            size_bytes: handle.bytes().len(),
            created_at: handle.created_at().to_rfc3339(),
        }
    }
}

/// 展示层状态快照。
#[derive(Debug, Clone, Serialize)]
pub struct ViewStatePayload {
    pub engine_ready: bool,
    pub processing: bool,
    pub result: Option<DegradeResultPayload>,
    pub last_error: Option<String>,
}

impl From<&ViewState> for ViewStatePayload {
    fn from(state: &ViewState) -> Self {
        Self {
            engine_ready: state.engine_ready,
            processing: state.is_processing(),
            result: state.result.as_ref().map(DegradeResultPayload::from),
            last_error: state.last_error.clone(),
        }
    }
}

/// 加载引擎。
pub async fn initialize_engine(state: &DegradeServiceState) -> Result<(), DegradeCommandError> {
    state.initialize_engine().await?;
    Ok(())
}

/// 从任意来源降质，返回结果与句柄（句柄用于取回字节）。
pub async fn degrade_source(
    state: &DegradeServiceState,
    source: ImageSource,
    amount: Option<u32>,
) -> Result<(DegradeResultPayload, ResultHandle), DegradeCommandError> {
    let handle = state.process_source(source, amount).await?;
    Ok((DegradeResultPayload::from(&handle), handle))
}

/// 降质本地文件。
pub async fn degrade_file(
    state: &DegradeServiceState,
    path: String,
    amount: Option<u32>,
) -> Result<DegradeResultPayload, DegradeCommandError> {
    let (payload, _) = degrade_source(state, ImageSource::FilePath(path), amount).await?;
    Ok(payload)
}

/// 降质 Data URL（粘贴或内联拖放）。
pub async fn degrade_data_url(
    state: &DegradeServiceState,
    data: String,
    amount: Option<u32>,
) -> Result<DegradeResultPayload, DegradeCommandError> {
    let (payload, _) = degrade_source(state, ImageSource::DataUrl(data), amount).await?;
    Ok(payload)
}

/// 降质网络图片。
pub async fn degrade_url(
    state: &DegradeServiceState,
    url: String,
    amount: Option<u32>,
) -> Result<DegradeResultPayload, DegradeCommandError> {
    let (payload, _) = degrade_source(state, ImageSource::Url(url), amount).await?;
    Ok(payload)
}

/// 清除当前结果。
pub fn reset_result(state: &DegradeServiceState) -> ViewStatePayload {
    state.reset();
    ViewStatePayload::from(&state.snapshot())
}

pub fn get_view_state(state: &DegradeServiceState) -> ViewStatePayload {
    ViewStatePayload::from(&state.snapshot())
}

/// 切换降质策略。
pub fn set_degradation_strategy(
    state: &DegradeServiceState,
    strategy: String,
) -> Result<(), DegradeCommandError> {
    state.set_strategy(&strategy)?;
    Ok(())
}

pub fn get_degradation_strategy(state: &DegradeServiceState) -> Result<String, DegradeCommandError> {
    Ok(state.get_strategy()?)
}
