//! # 结果状态仓库
//!
//! ## 设计思路
//!
//! 展示层关心的全部状态（引擎是否就绪、是否处理中、当前结果、最近错误）
//! 收敛为一个不可变值 `ViewState`，所有修改都经过唯一的纯函数 `reduce`。
//! `ResultStore` 是唯一写入方，内部用 `tokio::sync::watch` 广播最新状态。
//!
//! ## 实现思路
//!
//! - 处理中标志由 `in_flight > 0` 推导，不单独存储，避免与计数不一致。
//! - 发布结果时比较调用序号：序号不大于已发布序号、或早于最近一次 `reset` 的结果被丢弃。
//! - `clear()` 只释放仓库自身持有的引用，不回收展示层仍在使用的字节。

use bytes::Bytes;
use tokio::sync::watch;

use super::handle::ResultHandle;

/// 展示层可见状态。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub engine_ready: bool,
    /// 正在进行的降质调用数。
    pub in_flight: usize,
    pub result: Option<ResultHandle>,
    pub last_error: Option<String>,
    /// 最近一次被接受的结果序号。
    pub published_seq: u64,
    /// 序号不大于该值的调用在 `reset` 之前已开始，其结果不再发布。
    pub reset_floor: u64,
}

impl ViewState {
    /// 处理中标志。
    pub fn is_processing(&self) -> bool {
        self.in_flight > 0
    }
}

/// 状态变更动作。
#[derive(Debug, Clone)]
pub enum StoreAction {
    EngineReady(bool),
    RunStarted,
    RunFinished,
    RunFailed(String),
    Publish(ResultHandle),
    Reset { floor: u64 },
}

/// 唯一的状态转换函数。
pub fn reduce(state: &ViewState, action: StoreAction) -> ViewState {
    let mut next = state.clone();
    match action {
        StoreAction::EngineReady(ready) => next.engine_ready = ready,
        StoreAction::RunStarted => {
            next.in_flight += 1;
            next.last_error = None;
        }
        StoreAction::RunFinished => next.in_flight = next.in_flight.saturating_sub(1),
        StoreAction::RunFailed(message) => {
            next.in_flight = next.in_flight.saturating_sub(1);
            next.last_error = Some(message);
        }
        StoreAction::Publish(handle) => {
            if handle.seq() > next.published_seq && handle.seq() > next.reset_floor {
                next.published_seq = handle.seq();
                next.result = Some(handle);
            }
        }
        StoreAction::Reset { floor } => {
            next.result = None;
            next.last_error = None;
            next.reset_floor = next.reset_floor.max(floor);
        }
    }
    next
}

/// 结果仓库。
pub struct ResultStore {
    state: watch::Sender<ViewState>,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ViewState::default());
        Self { state }
    }

    /// 应用一个动作，返回状态是否发生变化。
    pub fn dispatch(&self, action: StoreAction) -> bool {
        self.state.send_if_modified(|state| {
            let next = reduce(state, action);
            if next == *state {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    /// 发布结果，返回是否被接受为当前结果。
    pub fn set(&self, handle: ResultHandle) -> bool {
        let mut accepted = false;
        self.state.send_if_modified(|state| {
            let next = reduce(state, StoreAction::Publish(handle));
            accepted = next.published_seq != state.published_seq;
            if accepted {
                *state = next;
            }
            accepted
        });
        accepted
    }

    /// 清除当前结果，并让 `floor` 及之前开始的调用不再发布。
    pub fn clear(&self, floor: u64) {
        self.dispatch(StoreAction::Reset { floor });
    }

    pub fn current(&self) -> Option<ResultHandle> {
        self.state.borrow().result.clone()
    }

    pub fn snapshot(&self) -> ViewState {
        self.state.borrow().clone()
    }

    pub fn is_processing(&self) -> bool {
        self.state.borrow().is_processing()
    }

    /// 订阅状态变化。
    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.state.subscribe()
    }

    /// 按 URL 解引用当前结果。
    pub fn resolve(&self, url: &str) -> Option<Bytes> {
        let state = self.state.borrow();
        state
            .result
            .as_ref()
            .filter(|handle| handle.url() == url)
            .map(|handle| handle.bytes().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(seq: u64) -> ResultHandle {
        ResultHandle::new(seq, &format!("{}-FILE-t.png", seq), Bytes::from(vec![seq as u8]), None)
    }

    #[test]
    fn processing_flag_tracks_in_flight_runs() {
        let state = ViewState::default();
        let started = reduce(&state, StoreAction::RunStarted);
        assert!(started.is_processing());

        let failed = reduce(&started, StoreAction::RunFailed("boom".into()));
        assert!(!failed.is_processing());
        assert_eq!(failed.last_error.as_deref(), Some("boom"));

        let extra_finish = reduce(&failed, StoreAction::RunFinished);
        assert_eq!(extra_finish.in_flight, 0);
    }

    #[test]
    fn stale_results_are_not_published() {
        let store = ResultStore::new();
        assert!(store.set(handle(2)));
        assert!(!store.set(handle(1)));
        assert_eq!(store.current().map(|h| h.seq()), Some(2));
        assert!(store.set(handle(3)));
        assert_eq!(store.current().map(|h| h.seq()), Some(3));
    }

    #[test]
    fn reset_clears_and_blocks_runs_started_before_it() {
        let store = ResultStore::new();
        assert!(store.set(handle(1)));

        store.clear(4);
        assert!(store.current().is_none());
        assert!(!store.set(handle(4)));
        assert!(store.set(handle(5)));
    }

    #[test]
    fn cleared_bytes_stay_alive_for_existing_holders() {
        let store = ResultStore::new();
        let published = handle(1);
        store.set(published.clone());

        let held = store.current().expect("current result");
        store.clear(1);

        assert!(store.current().is_none());
        assert_eq!(held.bytes(), published.bytes());
    }

    #[test]
    fn resolve_dereferences_current_url_only() {
        let store = ResultStore::new();
        let published = handle(9);
        store.set(published.clone());

        assert_eq!(store.resolve(published.url()), Some(published.bytes().clone()));
        assert_eq!(store.resolve("blob:meme-degrader/other.png"), None);
    }

    #[tokio::test]
    async fn subscribers_observe_changes() {
        let store = ResultStore::new();
        let mut rx = store.subscribe();

        store.dispatch(StoreAction::EngineReady(true));
        rx.changed().await.expect("state change");
        assert!(rx.borrow().engine_ready);

        assert!(!store.dispatch(StoreAction::EngineReady(true)));
    }
}
