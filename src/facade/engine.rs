use crate::config::EngineConfig;
use crate::core::{ChangeEvent, IndexError, Result};
use crate::query::{
    Grouping, KeyRange, RangePage, RangeQuery, ReduceQuery, ReduceRow, count_distinct_groups,
    execute_range, execute_reduce,
};
use crate::reduce::{Combiner, CombinerRegistry};
use crate::storage::{DocumentStore, ViewIndex};
use crate::view::{
    CatchUpReport, FailedChange, Freshness, IndexMaintainer, RebuildReason, StalenessController,
    ViewCatalog, ViewDefinition, ViewHandle, ViewStatus, validate_view_id, wait_for_watermark,
};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{Instrument, Level, event, info_span};

/// Incrementally maintained secondary indexes over a document store.
///
/// Views are registered with a projection and an optional reduce
/// specification. The engine keeps each view's sorted index in step with
/// the store's change feed and answers range and reduce queries against
/// immutable snapshots.
///
/// # Examples
///
/// ```
/// use docindex::{
///     Document, EmissionBuffer, EngineConfig, IndexEngine, MemoryDocumentStore,
///     ProjectionResult, RangeQuery, ReduceSpec, Value, ViewDefinition,
/// };
/// use std::sync::Arc;
///
/// fn by_status(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
///     if let Some(status) = doc.get_str("status") {
///         out.emit(status, Value::Null);
///     }
///     Ok(())
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> docindex::Result<()> {
/// let store = Arc::new(MemoryDocumentStore::new());
/// let engine = IndexEngine::new(store.clone(), EngineConfig::new());
/// engine
///     .register_view(ViewDefinition::from_fn("sample/status", by_status).with_reduce(ReduceSpec::Count))
///     .await?;
///
/// store.put(Document::new("s1", Some("sample")).with_field("status", "NEW")).await;
/// engine.catch_up("sample/status").await?;
///
/// let page = engine.range_query("sample/status", &RangeQuery::key("NEW")).await?;
/// assert_eq!(page.rows.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct IndexEngine {
    store: Arc<dyn DocumentStore>,
    config: EngineConfig,
    registry: RwLock<CombinerRegistry>,
    catalog: RwLock<ViewCatalog>,
    frontier: Arc<StalenessController>,
    maintainer: IndexMaintainer,
}

impl IndexEngine {
    pub fn new(store: Arc<dyn DocumentStore>, config: EngineConfig) -> Self {
        let frontier = Arc::new(StalenessController::new());
        let maintainer = IndexMaintainer::new(store.clone(), config.clone(), frontier.clone());
        Self {
            store,
            config,
            registry: RwLock::new(CombinerRegistry::new()),
            catalog: RwLock::new(ViewCatalog::new()),
            frontier,
            maintainer,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Makes `combiner` available to views declaring `ReduceSpec::Named(name)`.
    pub fn register_combiner(
        &self,
        name: impl Into<String>,
        combiner: Arc<dyn Combiner>,
    ) -> Result<()> {
        self.registry.write()?.register(name, combiner);
        Ok(())
    }

    fn catalog(&self) -> Result<ViewCatalog> {
        Ok(self.catalog.read()?.clone())
    }

    fn handle(&self, view_id: &str) -> Result<Arc<ViewHandle>> {
        self.catalog()?.get(view_id)
    }

    /// Registered view ids, sorted.
    pub fn views(&self) -> Result<Vec<String>> {
        Ok(self.catalog()?.ids())
    }

    /// Registers a view and builds its index.
    ///
    /// A matching checkpoint seeds the index and only the changes after its
    /// watermark are replayed; otherwise the whole store is scanned once.
    /// The view is visible as `Rebuilding` while this runs and is removed
    /// again if the build fails.
    pub async fn register_view(&self, definition: ViewDefinition) -> Result<ViewStatus> {
        validate_view_id(definition.id())?;
        let combiner = self
            .registry
            .read()?
            .resolve(definition.reduce(), self.config.sum_overflow)?;
        let view_id = definition.id().to_string();
        let handle = Arc::new(ViewHandle::new(
            definition,
            combiner,
            self.config.failed_change_capacity,
        ));
        handle.set_rebuilding(Some(RebuildReason::Registered))?;

        {
            let mut catalog = self.catalog.write()?;
            *catalog = catalog.clone().with_view(handle.clone())?;
        }

        let span = info_span!("view.register", view = %view_id);
        let built = async {
            match self.maintainer.restore(&handle).await {
                Some(_) => {
                    handle.set_rebuilding(None)?;
                    self.maintainer.catch_up(&handle).await
                }
                None => {
                    self.maintainer
                        .rebuild(&handle, RebuildReason::Registered)
                        .await
                }
            }
        }
        .instrument(span)
        .await;

        match built {
            Ok(report) => {
                event!(
                    Level::INFO,
                    view = %view_id,
                    watermark = report.watermark.0,
                    "view registered"
                );
                self.status(&view_id).await
            }
            Err(err) => {
                let mut catalog = self.catalog.write()?;
                if catalog.contains(&view_id) {
                    *catalog = catalog.clone().without_view(&view_id)?;
                }
                Err(err)
            }
        }
    }

    /// Drops a view and its checkpoint.
    pub fn unregister_view(&self, view_id: &str) -> Result<()> {
        {
            let mut catalog = self.catalog.write()?;
            *catalog = catalog.clone().without_view(view_id)?;
        }
        if let Some(checkpoints) = self.maintainer.checkpoints() {
            checkpoints.delete(view_id)?;
        }
        event!(Level::INFO, view = view_id, "view unregistered");
        Ok(())
    }

    /// Applies one change event to every view. Returns how many views
    /// changed; duplicate deliveries count as unchanged.
    ///
    /// Every view is attempted even when one fails; the first error is
    /// returned afterwards.
    pub async fn apply_change(&self, change: ChangeEvent) -> Result<usize> {
        self.frontier.observe(change.seq);
        let handles = self.catalog()?.handles();
        let outcomes = join_all(
            handles
                .iter()
                .map(|handle| self.maintainer.apply_change(handle, &change)),
        )
        .await;

        let mut applied = 0;
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(applied),
        }
    }

    pub async fn catch_up(&self, view_id: &str) -> Result<CatchUpReport> {
        let handle = self.handle(view_id)?;
        self.maintainer.catch_up(&handle).await
    }

    /// Catches every view up. Views are independent; the first error is
    /// returned after all of them ran.
    pub async fn catch_up_all(&self) -> Result<Vec<CatchUpReport>> {
        let handles = self.catalog()?.handles();
        let outcomes = join_all(
            handles
                .iter()
                .map(|handle| self.maintainer.catch_up(handle)),
        )
        .await;

        let mut reports = Vec::with_capacity(outcomes.len());
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(report) => reports.push(report),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(reports),
        }
    }

    /// Latest published snapshot of a view, however stale.
    pub fn snapshot(&self, view_id: &str) -> Result<Arc<ViewIndex>> {
        Ok(self.handle(view_id)?.snapshot())
    }

    /// Notification channel carrying every snapshot the view publishes.
    pub fn subscribe(&self, view_id: &str) -> Result<watch::Receiver<Arc<ViewIndex>>> {
        Ok(self.handle(view_id)?.subscribe())
    }

    async fn resolve_snapshot(
        &self,
        handle: &ViewHandle,
        freshness: Freshness,
    ) -> Result<Arc<ViewIndex>> {
        if handle.rebuild_reason()? == Some(RebuildReason::Corruption) {
            return Err(IndexError::CorruptIndex {
                view: handle.id().to_string(),
                detail: "rebuild in progress".to_string(),
            });
        }

        let timeout = match freshness {
            Freshness::AllowStale => return Ok(handle.snapshot()),
            Freshness::RequireFresh { timeout } => {
                timeout.unwrap_or_else(|| self.config.fresh_timeout_duration())
            }
        };

        let started = Instant::now();
        let wait = async {
            let target = self.store.latest_change().await?;
            self.frontier.observe(target);
            let mut rx = handle.subscribe();
            self.maintainer.catch_up(handle).await?;
            wait_for_watermark(handle.id(), &mut rx, target).await
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let watermark = handle.snapshot().watermark();
                let target = self.frontier.frontier();
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                event!(
                    Level::WARN,
                    view = handle.id(),
                    watermark = watermark.0,
                    target = target.0,
                    waited_ms,
                    "require-fresh query timed out"
                );
                Err(IndexError::StalenessTimeout {
                    view: handle.id().to_string(),
                    watermark: watermark.0,
                    target: target.0,
                    waited_ms,
                })
            }
        }
    }

    /// Ordered `(key, value, doc_id)` rows of a view. With `include_docs`
    /// each row also carries the store's current copy of its document.
    pub async fn range_query(&self, view_id: &str, query: &RangeQuery) -> Result<RangePage> {
        let handle = self.handle(view_id)?;
        let snapshot = self.resolve_snapshot(&handle, query.freshness).await?;
        let mut page = execute_range(handle.id(), &snapshot, query)?;
        if query.include_docs {
            let docs = join_all(page.rows.iter().map(|row| self.store.fetch(&row.doc_id))).await;
            for (row, doc) in page.rows.iter_mut().zip(docs) {
                row.doc = doc?;
            }
        }
        Ok(page)
    }

    /// Aggregates over a key range, one row per group.
    pub async fn reduce_query(&self, view_id: &str, query: &ReduceQuery) -> Result<Vec<ReduceRow>> {
        let handle = self.handle(view_id)?;
        let snapshot = self.resolve_snapshot(&handle, query.freshness).await?;
        execute_reduce(handle.id(), &snapshot, query)
    }

    /// Number of distinct group keys within `range`. Needs no reduce
    /// specification.
    pub async fn distinct_groups(
        &self,
        view_id: &str,
        range: &KeyRange,
        grouping: Grouping,
        freshness: Freshness,
    ) -> Result<usize> {
        let handle = self.handle(view_id)?;
        let snapshot = self.resolve_snapshot(&handle, freshness).await?;
        count_distinct_groups(&snapshot, range, grouping)
    }

    pub async fn status(&self, view_id: &str) -> Result<ViewStatus> {
        let handle = self.handle(view_id)?;
        self.frontier.observe(self.store.latest_change().await?);

        let snapshot = handle.snapshot();
        let rebuild_reason = handle.rebuild_reason()?;
        Ok(ViewStatus {
            view_id: handle.id().to_string(),
            state: self.frontier.state(snapshot.watermark(), rebuild_reason),
            rebuild_reason,
            watermark: snapshot.watermark(),
            frontier: self.frontier.frontier(),
            entries: snapshot.len(),
            documents: snapshot.documents(),
            failed_changes: handle.failed_changes()?.len(),
        })
    }

    /// Changes that exhausted their retries, oldest first.
    pub fn failed_changes(&self, view_id: &str) -> Result<Vec<FailedChange>> {
        self.handle(view_id)?.failed_changes()
    }

    /// Rebuilds a view from a full store scan.
    pub async fn rebuild(&self, view_id: &str) -> Result<CatchUpReport> {
        let handle = self.handle(view_id)?;
        self.maintainer
            .rebuild(&handle, RebuildReason::Requested)
            .await
    }

    /// Checks the structural invariants of a view's index. A violation
    /// triggers a rebuild and is reported as `CorruptIndex`.
    pub async fn verify(&self, view_id: &str) -> Result<()> {
        let handle = self.handle(view_id)?;
        let checked = handle.lock_writer().await.verify();
        let Err(detail) = checked else {
            return Ok(());
        };

        event!(
            Level::ERROR,
            view = view_id,
            detail = %detail,
            "index corruption detected, rebuilding"
        );
        self.maintainer
            .rebuild(&handle, RebuildReason::Corruption)
            .await?;
        Err(IndexError::CorruptIndex {
            view: view_id.to_string(),
            detail,
        })
    }

    /// Writes a checkpoint of one view. `Ok(None)` when checkpoints are off.
    pub fn checkpoint(&self, view_id: &str) -> Result<Option<PathBuf>> {
        let handle = self.handle(view_id)?;
        self.maintainer.checkpoint(&handle)
    }

    pub fn checkpoint_all(&self) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for handle in self.catalog()?.handles() {
            if let Some(path) = self.maintainer.checkpoint(&handle)? {
                written.push(path);
            }
        }
        Ok(written)
    }
}
