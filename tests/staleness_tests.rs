use async_trait::async_trait;
use docindex::{
    ChangeEvent, ChangeSeq, DocId, Document, DocumentStore, EmissionBuffer, EngineConfig,
    Freshness, IndexEngine, IndexError, MemoryDocumentStore, ProjectionResult, RangeQuery,
    RebuildReason, Result, Value, ViewDefinition, ViewState,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{Duration, Instant, sleep, timeout};

/// Memory store whose feed and scans can be slowed down.
struct SlowStore {
    inner: MemoryDocumentStore,
    delay: Duration,
    slow: AtomicBool,
}

impl SlowStore {
    fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryDocumentStore::new(),
            delay,
            slow: AtomicBool::new(false),
        }
    }

    fn set_slow(&self, slow: bool) {
        self.slow.store(slow, Ordering::SeqCst);
    }

    async fn pause(&self) {
        if self.slow.load(Ordering::SeqCst) {
            sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl DocumentStore for SlowStore {
    async fn fetch(&self, id: &DocId) -> Result<Option<Document>> {
        self.inner.fetch(id).await
    }

    async fn changes_since(&self, since: ChangeSeq, limit: usize) -> Result<Vec<ChangeEvent>> {
        self.pause().await;
        self.inner.changes_since(since, limit).await
    }

    async fn latest_change(&self) -> Result<ChangeSeq> {
        self.inner.latest_change().await
    }

    async fn scan_all(&self) -> Result<Vec<Document>> {
        self.pause().await;
        self.inner.scan_all().await
    }
}

fn by_status(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(status) = doc.get("status") {
        out.emit(status.clone(), Value::Null);
    }
    Ok(())
}

fn sample(id: &str, status: &str) -> Document {
    Document::new(id, Some("sample")).with_field("status", status)
}

async fn setup(delay: Duration) -> (Arc<SlowStore>, Arc<IndexEngine>) {
    let store = Arc::new(SlowStore::new(delay));
    store.inner.put(sample("s1", "NEW")).await;
    let engine = Arc::new(IndexEngine::new(store.clone(), EngineConfig::new()));
    engine
        .register_view(ViewDefinition::from_fn("sample/status", by_status))
        .await
        .unwrap();
    (store, engine)
}

#[tokio::test]
async fn test_allow_stale_serves_lagging_snapshot() {
    let (store, engine) = setup(Duration::from_millis(0)).await;
    store.inner.put(sample("s2", "NEW")).await;

    let page = engine
        .range_query("sample/status", &RangeQuery::all())
        .await
        .unwrap();
    assert_eq!(page.rows.len(), 1);
    assert_eq!(page.watermark, ChangeSeq(1));

    let status = engine.status("sample/status").await.unwrap();
    assert_eq!(status.state, ViewState::Lagging);
    assert_eq!(status.lag(), 1);

    let fresh = engine
        .range_query(
            "sample/status",
            &RangeQuery::all().with_freshness(Freshness::require_fresh()),
        )
        .await
        .unwrap();
    assert_eq!(fresh.rows.len(), 2);
    assert_eq!(fresh.watermark, ChangeSeq(2));
    assert_eq!(
        engine.status("sample/status").await.unwrap().state,
        ViewState::Fresh
    );
}

#[tokio::test]
async fn test_require_fresh_times_out_with_transient_error() {
    let (store, engine) = setup(Duration::from_millis(500)).await;
    store.inner.put(sample("s2", "DONE")).await;
    store.set_slow(true);

    let started = Instant::now();
    let err = engine
        .range_query(
            "sample/status",
            &RangeQuery::all()
                .with_freshness(Freshness::require_fresh_within(Duration::from_millis(50))),
        )
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(450));

    match &err {
        IndexError::StalenessTimeout {
            watermark, target, ..
        } => {
            assert_eq!(*watermark, 1);
            assert_eq!(*target, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_transient());

    // The stale snapshot is still readable.
    let stale = engine
        .range_query("sample/status", &RangeQuery::all())
        .await
        .unwrap();
    assert_eq!(stale.rows.len(), 1);
}

#[tokio::test]
async fn test_default_fresh_timeout_comes_from_config() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(500)));
    let engine = IndexEngine::new(
        store.clone(),
        EngineConfig::new().fresh_timeout(Duration::from_millis(30)),
    );
    engine
        .register_view(ViewDefinition::from_fn("sample/status", by_status))
        .await
        .unwrap();
    store.inner.put(sample("s1", "NEW")).await;
    store.set_slow(true);

    let err = engine
        .range_query(
            "sample/status",
            &RangeQuery::all().with_freshness(Freshness::require_fresh()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::StalenessTimeout { .. }));
}

#[tokio::test]
async fn test_cancelled_fresh_query_leaves_no_trace() {
    let (store, engine) = setup(Duration::from_millis(300)).await;
    store.inner.put(sample("s2", "DONE")).await;
    store.set_slow(true);

    let query = RangeQuery::all().with_freshness(Freshness::require_fresh_within(
        Duration::from_secs(30),
    ));
    let cancelled = timeout(
        Duration::from_millis(20),
        engine.range_query("sample/status", &query),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(engine.snapshot("sample/status").unwrap().watermark(), ChangeSeq(1));

    store.set_slow(false);
    let page = engine.range_query("sample/status", &query).await.unwrap();
    assert_eq!(page.rows.len(), 2);
}

#[tokio::test]
async fn test_concurrent_fresh_queries_all_see_the_change() {
    let (store, engine) = setup(Duration::from_millis(20)).await;
    store.inner.put(sample("s2", "DONE")).await;
    store.set_slow(true);

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .range_query(
                    "sample/status",
                    &RangeQuery::all().with_freshness(Freshness::require_fresh()),
                )
                .await
                .map(|page| page.rows.len())
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 2);
    }
}

#[tokio::test]
async fn test_rebuild_is_visible_and_does_not_block_readers() {
    let (store, engine) = setup(Duration::from_millis(200)).await;
    store.set_slow(true);

    let rebuilding = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.rebuild("sample/status").await })
    };
    sleep(Duration::from_millis(50)).await;

    let status = engine.status("sample/status").await.unwrap();
    assert_eq!(status.state, ViewState::Rebuilding);
    assert_eq!(status.rebuild_reason, Some(RebuildReason::Requested));

    let started = Instant::now();
    let page = engine
        .range_query("sample/status", &RangeQuery::all())
        .await
        .unwrap();
    assert_eq!(page.rows.len(), 1);
    assert!(started.elapsed() < Duration::from_millis(100));

    rebuilding.await.unwrap().unwrap();
    let status = engine.status("sample/status").await.unwrap();
    assert_eq!(status.state, ViewState::Fresh);
    assert_eq!(status.rebuild_reason, None);
}
