// ============================================================================
// Index maintainer
// ============================================================================
//
// Applies change-feed events to view indexes. Every view has exactly one
// writer: the working index behind the handle's writer mutex. A change is
// projected, diffed against the entries already stored for the document,
// applied, and published as a new snapshot before the next one starts, so
// readers only ever see whole documents and a watermark that matches the
// contents.
//
// ============================================================================

use super::catalog::ViewHandle;
use super::staleness::{RebuildReason, StalenessController};
use crate::config::EngineConfig;
use crate::core::{ChangeEvent, ChangeSeq, DocId, Document, IndexError, Result, Value};
use crate::projection::project_document;
use crate::storage::{CheckpointStore, DocumentStore, EntryKey, ViewCheckpoint, ViewIndex};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, Level, event, info_span};

/// A change that could not be applied to a view after all retries.
#[derive(Debug, Clone, Serialize)]
pub struct FailedChange {
    pub seq: ChangeSeq,
    pub doc_id: DocId,
    pub attempts: u32,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

/// Outcome of one catch-up pass over a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatchUpReport {
    pub view: String,
    pub applied: usize,
    /// Events at or below the watermark (duplicate delivery).
    pub skipped: usize,
    pub watermark: ChangeSeq,
}

impl CatchUpReport {
    fn new(view: &str, watermark: ChangeSeq) -> Self {
        Self {
            view: view.to_string(),
            applied: 0,
            skipped: 0,
            watermark,
        }
    }
}

pub struct IndexMaintainer {
    store: Arc<dyn DocumentStore>,
    config: EngineConfig,
    staleness: Arc<StalenessController>,
    checkpoints: Option<CheckpointStore>,
}

impl IndexMaintainer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: EngineConfig,
        staleness: Arc<StalenessController>,
    ) -> Self {
        let checkpoints = config.checkpoint.dir.as_ref().map(CheckpointStore::new);
        Self {
            store,
            config,
            staleness,
            checkpoints,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn checkpoints(&self) -> Option<&CheckpointStore> {
        self.checkpoints.as_ref()
    }

    /// Projects `doc` for `view`, retrying with backoff. A missing document
    /// projects to nothing.
    async fn project(
        &self,
        view: &ViewHandle,
        seq: ChangeSeq,
        doc_id: &DocId,
        doc: Option<&Document>,
    ) -> Result<Vec<(EntryKey, Value)>> {
        let Some(doc) = doc else {
            return Ok(Vec::new());
        };

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match project_document(view.definition().projection().as_ref(), doc) {
                Ok(out) => return Ok(out.into_entries(doc_id)),
                Err(failure) if attempt < max_attempts => {
                    let backoff = self.config.retry.backoff_ms(attempt);
                    event!(
                        Level::WARN,
                        view = view.id(),
                        doc_id = %doc_id,
                        seq = seq.0,
                        attempt,
                        backoff_ms = backoff,
                        error = %failure,
                        "projection failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(failure) => {
                    event!(
                        Level::ERROR,
                        view = view.id(),
                        doc_id = %doc_id,
                        seq = seq.0,
                        attempts = attempt,
                        error = %failure,
                        "projection failed, change not applied"
                    );
                    view.record_failure(FailedChange {
                        seq,
                        doc_id: doc_id.clone(),
                        attempts: attempt,
                        message: failure.message.clone(),
                        failed_at: Utc::now(),
                    })?;
                    return Err(IndexError::Projection {
                        view: view.id().to_string(),
                        doc_id: doc_id.to_string(),
                        attempts: attempt,
                        message: failure.message,
                    });
                }
            }
        }
    }

    /// Applies one event to the locked working index and publishes it.
    /// Returns `false` when the event was already reflected.
    async fn apply_locked(
        &self,
        view: &ViewHandle,
        index: &mut ViewIndex,
        change: &ChangeEvent,
        doc: Option<&Document>,
    ) -> Result<bool> {
        if change.seq <= index.watermark() {
            event!(
                Level::DEBUG,
                view = view.id(),
                seq = change.seq.0,
                watermark = index.watermark().0,
                "duplicate change skipped"
            );
            return Ok(false);
        }

        let entries = self.project(view, change.seq, &change.doc_id, doc).await?;
        let stats = index.apply_document(&change.doc_id, entries);
        index.advance_watermark(change.seq);
        view.publish(index);
        view.clear_failures(&change.doc_id)?;
        event!(
            Level::DEBUG,
            view = view.id(),
            seq = change.seq.0,
            doc_id = %change.doc_id,
            inserted = stats.inserted,
            removed = stats.removed,
            unchanged = stats.unchanged,
            "change applied"
        );

        if let Some(every) = self.config.checkpoint.every_changes
            && self.checkpoints.is_some()
            && view.note_applied() >= every
            && let Err(err) = self.checkpoint_index(view, index)
        {
            view.reset_applied();
            event!(Level::WARN, view = view.id(), error = %err, "automatic checkpoint failed");
        }
        Ok(true)
    }

    /// Drains the change feed into the locked index, stopping after
    /// `bound` when one is given.
    async fn catch_up_locked(
        &self,
        view: &ViewHandle,
        index: &mut ViewIndex,
        bound: Option<ChangeSeq>,
    ) -> Result<CatchUpReport> {
        let batch = self.config.catch_up_batch_size.max(1);
        let mut report = CatchUpReport::new(view.id(), index.watermark());

        'feed: loop {
            let changes = self.store.changes_since(index.watermark(), batch).await?;
            if changes.is_empty() {
                break;
            }

            let mut progressed = false;
            for change in &changes {
                if bound.is_some_and(|b| change.seq > b) {
                    break 'feed;
                }
                self.staleness.observe(change.seq);
                if change.seq <= index.watermark() {
                    report.skipped += 1;
                    continue;
                }
                let doc = self.store.fetch(&change.doc_id).await?;
                if self.apply_locked(view, index, change, doc.as_ref()).await? {
                    report.applied += 1;
                    progressed = true;
                } else {
                    report.skipped += 1;
                }
            }

            if !progressed || changes.len() < batch {
                break;
            }
        }

        report.watermark = index.watermark();
        Ok(report)
    }

    /// Brings `view` up to the newest change in the feed.
    pub async fn catch_up(&self, view: &ViewHandle) -> Result<CatchUpReport> {
        let span = info_span!("view.catch_up", view = view.id());
        async {
            let mut index = view.lock_writer().await;
            let report = self.catch_up_locked(view, &mut index, None).await?;
            if report.applied > 0 {
                event!(
                    Level::DEBUG,
                    applied = report.applied,
                    skipped = report.skipped,
                    watermark = report.watermark.0,
                    "view caught up"
                );
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Applies a single event to `view`. Earlier feed events the view has
    /// not seen yet are applied first so the view never skips ahead.
    pub async fn apply_change(&self, view: &ViewHandle, change: &ChangeEvent) -> Result<bool> {
        let span = info_span!(
            "view.apply",
            view = view.id(),
            seq = change.seq.0,
            doc_id = %change.doc_id
        );
        async {
            let mut index = view.lock_writer().await;
            if change.seq <= index.watermark() {
                event!(Level::DEBUG, watermark = index.watermark().0, "duplicate change skipped");
                return Ok(false);
            }

            self.catch_up_locked(view, &mut index, Some(change.seq)).await?;
            if index.watermark() >= change.seq {
                return Ok(true);
            }

            let doc = self.store.fetch(&change.doc_id).await?;
            self.apply_locked(view, &mut index, change, doc.as_ref()).await
        }
        .instrument(span)
        .await
    }

    /// Rebuilds `view` from a full scan of the store, then catches up.
    ///
    /// The frontier is captured before scanning; anything that changes
    /// during the scan is replayed by the catch-up. A failed corruption
    /// rebuild leaves the view marked so queries keep failing.
    pub async fn rebuild(&self, view: &ViewHandle, reason: RebuildReason) -> Result<CatchUpReport> {
        view.set_rebuilding(Some(reason))?;
        let span = info_span!("view.rebuild", view = view.id(), reason = ?reason);
        let outcome = self.rebuild_inner(view).instrument(span).await;

        match &outcome {
            Ok(_) => view.set_rebuilding(None)?,
            Err(err) => {
                if reason != RebuildReason::Corruption {
                    view.set_rebuilding(None)?;
                }
                event!(Level::ERROR, view = view.id(), error = %err, "view rebuild failed");
            }
        }
        outcome
    }

    async fn rebuild_inner(&self, view: &ViewHandle) -> Result<CatchUpReport> {
        let started = Instant::now();
        let mut index = view.lock_writer().await;
        event!(Level::INFO, "view rebuild started");

        let frontier = self.store.latest_change().await?;
        self.staleness.observe(frontier);
        let docs = self.store.scan_all().await?;

        let mut entries = Vec::new();
        for doc in &docs {
            entries.extend(self.project(view, frontier, &doc.id, Some(doc)).await?);
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let rebuilt = ViewIndex::from_entries(entries, view.combiner().cloned(), frontier)
            .map_err(|detail| IndexError::CorruptIndex {
                view: view.id().to_string(),
                detail,
            })?;
        *index = rebuilt;
        view.publish(&index);
        view.reset_applied();

        event!(
            Level::INFO,
            documents = docs.len(),
            entries = index.len(),
            watermark = frontier.0,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "view rebuild finished"
        );

        self.catch_up_locked(view, &mut index, None).await
    }

    /// Seeds `view` from its checkpoint. Returns the restored watermark, or
    /// `None` when there is no usable checkpoint.
    pub async fn restore(&self, view: &ViewHandle) -> Option<ChangeSeq> {
        let store = self.checkpoints.as_ref()?;
        let checkpoint = match store.load(view.id()) {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return None,
            Err(err) => {
                event!(Level::WARN, view = view.id(), error = %err, "unreadable checkpoint ignored");
                return None;
            }
        };

        if !checkpoint.matches(view.id(), view.definition().reduce()) {
            event!(
                Level::WARN,
                view = view.id(),
                checkpoint_reduce = %checkpoint.reduce,
                "checkpoint does not match view definition, ignored"
            );
            return None;
        }

        let watermark = checkpoint.watermark;
        let restored = checkpoint
            .into_index(view.combiner().cloned())
            .and_then(|index| index.verify().map(|_| index));
        match restored {
            Ok(restored) => {
                let mut index = view.lock_writer().await;
                *index = restored;
                view.publish(&index);
                view.reset_applied();
                event!(
                    Level::INFO,
                    view = view.id(),
                    watermark = watermark.0,
                    entries = index.len(),
                    "view restored from checkpoint"
                );
                Some(watermark)
            }
            Err(detail) => {
                event!(Level::WARN, view = view.id(), detail = %detail, "invalid checkpoint ignored");
                None
            }
        }
    }

    fn checkpoint_index(&self, view: &ViewHandle, index: &ViewIndex) -> Result<Option<PathBuf>> {
        let Some(store) = &self.checkpoints else {
            return Ok(None);
        };
        let checkpoint = ViewCheckpoint::capture(view.id(), view.definition().reduce(), index);
        let path = store.save(&checkpoint)?;
        view.reset_applied();
        event!(
            Level::INFO,
            view = view.id(),
            watermark = checkpoint.watermark.0,
            entries = checkpoint.entries.len(),
            path = %path.display(),
            "checkpoint written"
        );
        Ok(Some(path))
    }

    /// Writes the current snapshot of `view` to its checkpoint file.
    /// `Ok(None)` when checkpoints are not configured.
    pub fn checkpoint(&self, view: &ViewHandle) -> Result<Option<PathBuf>> {
        let snapshot = view.snapshot();
        let span = info_span!("view.checkpoint", view = view.id());
        let _enter = span.enter();
        self.checkpoint_index(view, &snapshot)
    }
}
