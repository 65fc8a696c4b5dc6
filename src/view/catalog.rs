use super::maintainer::FailedChange;
use super::staleness::RebuildReason;
use crate::core::{DocId, Document, IndexError, Result};
use crate::projection::{EmissionBuffer, Projection, ProjectionResult};
use crate::reduce::{Combiner, ReduceSpec};
use crate::storage::ViewIndex;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::{Mutex, MutexGuard, watch};

lazy_static! {
    static ref VIEW_ID_PATTERN: Regex =
        Regex::new(r"^[A-Za-z][A-Za-z0-9_.\-]*(/[A-Za-z0-9_.\-]+)*$").expect("view id pattern");
}

/// View ids look like `design/view`: letters, digits, `_`, `.`, `-`,
/// separated by `/`, starting with a letter.
pub fn validate_view_id(id: &str) -> Result<()> {
    if VIEW_ID_PATTERN.is_match(id) && !id.contains("..") {
        Ok(())
    } else {
        Err(IndexError::InvalidViewId(id.to_string()))
    }
}

/// A named projection plus its reduce specification. Immutable once
/// registered.
#[derive(Clone)]
pub struct ViewDefinition {
    id: String,
    projection: Arc<dyn Projection>,
    reduce: ReduceSpec,
}

impl ViewDefinition {
    pub fn new(id: impl Into<String>, projection: impl Projection + 'static) -> Self {
        Self {
            id: id.into(),
            projection: Arc::new(projection),
            reduce: ReduceSpec::None,
        }
    }

    pub fn from_fn<F>(id: impl Into<String>, projection: F) -> Self
    where
        F: Fn(&Document, &mut EmissionBuffer) -> ProjectionResult + Send + Sync + 'static,
    {
        Self::new(id, projection)
    }

    pub fn with_reduce(mut self, reduce: ReduceSpec) -> Self {
        self.reduce = reduce;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn projection(&self) -> &Arc<dyn Projection> {
        &self.projection
    }

    pub fn reduce(&self) -> &ReduceSpec {
        &self.reduce
    }
}

impl fmt::Debug for ViewDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewDefinition")
            .field("id", &self.id)
            .field("reduce", &self.reduce)
            .finish()
    }
}

/// Runtime state of one registered view.
///
/// Readers take the published snapshot; the single writer mutates its own
/// working copy under `writer` and publishes after every applied change.
pub struct ViewHandle {
    definition: ViewDefinition,
    combiner: Option<Arc<dyn Combiner>>,
    published: watch::Sender<Arc<ViewIndex>>,
    writer: Mutex<ViewIndex>,
    rebuilding: StdRwLock<Option<RebuildReason>>,
    failed: StdMutex<VecDeque<FailedChange>>,
    failed_capacity: usize,
    applied_since_checkpoint: AtomicUsize,
}

impl ViewHandle {
    pub fn new(
        definition: ViewDefinition,
        combiner: Option<Arc<dyn Combiner>>,
        failed_capacity: usize,
    ) -> Self {
        let index = ViewIndex::new(combiner.clone());
        let (published, _) = watch::channel(Arc::new(index.clone()));
        Self {
            definition,
            combiner,
            published,
            writer: Mutex::new(index),
            rebuilding: StdRwLock::new(None),
            failed: StdMutex::new(VecDeque::new()),
            failed_capacity,
            applied_since_checkpoint: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        self.definition.id()
    }

    pub fn definition(&self) -> &ViewDefinition {
        &self.definition
    }

    pub fn combiner(&self) -> Option<&Arc<dyn Combiner>> {
        self.combiner.as_ref()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<ViewIndex> {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ViewIndex>> {
        self.published.subscribe()
    }

    pub(crate) fn publish(&self, index: &ViewIndex) {
        self.published.send_replace(Arc::new(index.clone()));
    }

    pub(crate) async fn lock_writer(&self) -> MutexGuard<'_, ViewIndex> {
        self.writer.lock().await
    }

    pub fn rebuild_reason(&self) -> Result<Option<RebuildReason>> {
        Ok(*self.rebuilding.read()?)
    }

    pub(crate) fn set_rebuilding(&self, reason: Option<RebuildReason>) -> Result<()> {
        *self.rebuilding.write()? = reason;
        Ok(())
    }

    /// Queues a failed change for operators, replacing an earlier failure
    /// of the same change. The oldest entry is dropped when full.
    pub(crate) fn record_failure(&self, failure: FailedChange) -> Result<()> {
        let mut failed = self.failed.lock()?;
        failed.retain(|f| !(f.seq == failure.seq && f.doc_id == failure.doc_id));
        if self.failed_capacity == 0 {
            return Ok(());
        }
        while failed.len() >= self.failed_capacity {
            failed.pop_front();
        }
        failed.push_back(failure);
        Ok(())
    }

    pub(crate) fn clear_failures(&self, doc_id: &DocId) -> Result<()> {
        self.failed.lock()?.retain(|f| &f.doc_id != doc_id);
        Ok(())
    }

    pub fn failed_changes(&self) -> Result<Vec<FailedChange>> {
        Ok(self.failed.lock()?.iter().cloned().collect())
    }

    /// Counts one applied change; returns the count since the last reset.
    pub(crate) fn note_applied(&self) -> usize {
        self.applied_since_checkpoint.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_applied(&self) {
        self.applied_since_checkpoint.store(0, Ordering::Release);
    }
}

impl fmt::Debug for ViewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewHandle")
            .field("definition", &self.definition)
            .field("watermark", &self.snapshot().watermark())
            .finish()
    }
}

/// Registered views. Immutable once built, so readers clone it without
/// holding a lock; changes produce a new catalog.
#[derive(Clone, Default)]
pub struct ViewCatalog {
    views: Arc<HashMap<String, Arc<ViewHandle>>>,
}

impl ViewCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new catalog with `handle` added.
    pub fn with_view(self, handle: Arc<ViewHandle>) -> Result<Self> {
        let id = handle.id().to_string();
        if self.views.contains_key(&id) {
            return Err(IndexError::ViewExists(id));
        }
        let mut views = (*self.views).clone();
        views.insert(id, handle);
        Ok(Self {
            views: Arc::new(views),
        })
    }

    /// Returns a new catalog without `id`.
    pub fn without_view(self, id: &str) -> Result<Self> {
        if !self.views.contains_key(id) {
            return Err(IndexError::ViewNotFound(id.to_string()));
        }
        let mut views = (*self.views).clone();
        views.remove(id);
        Ok(Self {
            views: Arc::new(views),
        })
    }

    pub fn get(&self, id: &str) -> Result<Arc<ViewHandle>> {
        self.views
            .get(id)
            .cloned()
            .ok_or_else(|| IndexError::ViewNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.views.contains_key(id)
    }

    /// View ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.views.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Handles in id order.
    pub fn handles(&self) -> Vec<Arc<ViewHandle>> {
        self.ids()
            .iter()
            .filter_map(|id| self.views.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChangeSeq;
    use chrono::Utc;

    fn noop(_: &Document, _: &mut EmissionBuffer) -> ProjectionResult {
        Ok(())
    }

    fn handle(id: &str) -> Arc<ViewHandle> {
        Arc::new(ViewHandle::new(ViewDefinition::from_fn(id, noop), None, 2))
    }

    #[test]
    fn test_view_id_validation() {
        for ok in ["sample/not_done", "user/api_token", "scratch", "v1.beta/by-name"] {
            assert!(validate_view_id(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "/sample", "sample/", "9lives", "a/../b", "a b", "a//b"] {
            assert!(validate_view_id(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_catalog_copy_on_write() {
        let catalog = ViewCatalog::new().with_view(handle("a/x")).unwrap();
        let before = catalog.clone();
        let after = catalog.with_view(handle("b/y")).unwrap();

        assert_eq!(before.ids(), vec!["a/x"]);
        assert_eq!(after.ids(), vec!["a/x", "b/y"]);
        assert!(matches!(
            after.clone().with_view(handle("a/x")),
            Err(IndexError::ViewExists(_))
        ));

        let removed = after.without_view("a/x").unwrap();
        assert!(!removed.contains("a/x"));
        assert!(matches!(removed.get("a/x"), Err(IndexError::ViewNotFound(_))));
    }

    #[test]
    fn test_failed_change_queue_is_bounded_and_deduplicated() {
        let view = handle("a/x");
        let failure = |seq: u64, doc: &str| FailedChange {
            seq: ChangeSeq(seq),
            doc_id: DocId::new(doc),
            attempts: 3,
            message: "boom".to_string(),
            failed_at: Utc::now(),
        };
        view.record_failure(failure(1, "d1")).unwrap();
        view.record_failure(failure(1, "d1")).unwrap();
        assert_eq!(view.failed_changes().unwrap().len(), 1);

        view.record_failure(failure(2, "d2")).unwrap();
        view.record_failure(failure(3, "d3")).unwrap();
        let seqs: Vec<_> = view.failed_changes().unwrap().iter().map(|f| f.seq.0).collect();
        assert_eq!(seqs, vec![2, 3]);

        view.clear_failures(&DocId::new("d2")).unwrap();
        assert_eq!(view.failed_changes().unwrap().len(), 1);
    }
}
