use crate::core::{ChangeSeq, IndexError, Result};
use crate::storage::ViewIndex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Per-query consistency requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Serve the current snapshot, however far behind it is.
    #[default]
    AllowStale,
    /// Catch up with the store's latest change first, waiting at most
    /// `timeout` (the engine default when `None`).
    RequireFresh { timeout: Option<Duration> },
}

impl Freshness {
    pub fn require_fresh() -> Self {
        Freshness::RequireFresh { timeout: None }
    }

    pub fn require_fresh_within(timeout: Duration) -> Self {
        Freshness::RequireFresh {
            timeout: Some(timeout),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViewState {
    Fresh,
    Lagging,
    Rebuilding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RebuildReason {
    /// First build of a newly registered view.
    Registered,
    /// Explicit rebuild request.
    Requested,
    /// A structural check failed.
    Corruption,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewStatus {
    pub view_id: String,
    pub state: ViewState,
    pub rebuild_reason: Option<RebuildReason>,
    pub watermark: ChangeSeq,
    /// Newest store change the engine has observed.
    pub frontier: ChangeSeq,
    pub entries: usize,
    pub documents: usize,
    pub failed_changes: usize,
}

impl ViewStatus {
    pub fn lag(&self) -> u64 {
        self.frontier.0.saturating_sub(self.watermark.0)
    }
}

/// Tracks the store's change frontier and classifies views against it.
#[derive(Debug, Default)]
pub struct StalenessController {
    frontier: AtomicU64,
}

impl StalenessController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a change identifier seen on the store. The frontier only
    /// moves forward.
    pub fn observe(&self, seq: ChangeSeq) -> ChangeSeq {
        let previous = self.frontier.fetch_max(seq.0, Ordering::AcqRel);
        ChangeSeq(previous.max(seq.0))
    }

    pub fn frontier(&self) -> ChangeSeq {
        ChangeSeq(self.frontier.load(Ordering::Acquire))
    }

    pub fn state(&self, watermark: ChangeSeq, rebuilding: Option<RebuildReason>) -> ViewState {
        if rebuilding.is_some() {
            ViewState::Rebuilding
        } else if watermark >= self.frontier() {
            ViewState::Fresh
        } else {
            ViewState::Lagging
        }
    }
}

/// Parks until the published snapshot reaches `target`.
///
/// Cancel-safe: dropping the future only drops the receiver.
pub async fn wait_for_watermark(
    view: &str,
    rx: &mut watch::Receiver<Arc<ViewIndex>>,
    target: ChangeSeq,
) -> Result<Arc<ViewIndex>> {
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if snapshot.watermark() >= target {
            return Ok(snapshot);
        }
        rx.changed()
            .await
            .map_err(|_| IndexError::ViewNotFound(view.to_string()))?;
    }
}
