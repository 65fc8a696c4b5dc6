use crate::core::{ChangeSeq, IndexError, Result};
use crate::facade::IndexEngine;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// Background task keeping every registered view caught up.
pub struct IndexWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
    last_error: Arc<StdMutex<Option<String>>>,
}

impl IndexWorker {
    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| IndexError::Worker(format!("index worker join: {}", err)))?;
        }
        Ok(())
    }

    /// Message of the most recent failed pass, cleared by a successful one.
    pub fn last_error(&self) -> Result<Option<String>> {
        Ok(self.last_error.lock()?.clone())
    }
}

impl Drop for IndexWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

async fn store_signal(changes: &mut Option<watch::Receiver<ChangeSeq>>) -> bool {
    match changes {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

/// Spawns a worker that catches all views up whenever the store signals a
/// change, and at least once per poll interval.
pub fn spawn_index_worker(engine: Arc<IndexEngine>) -> IndexWorker {
    let interval = engine.config().poll_interval_duration();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let last_error = Arc::new(StdMutex::new(None));
    let errors = last_error.clone();
    let mut changes = engine.store().subscribe();

    let join_handle = tokio::spawn(async move {
        event!(
            Level::INFO,
            poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            push = changes.is_some(),
            "index worker started"
        );
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                open = store_signal(&mut changes) => {
                    if !open {
                        changes = None;
                    }
                }
                _ = sleep(interval) => {}
            }

            let outcome = engine.catch_up_all().await;
            if let Ok(mut slot) = errors.lock() {
                *slot = outcome.as_ref().err().map(|err| err.to_string());
            }
            match outcome {
                Ok(reports) => {
                    let applied: usize = reports.iter().map(|r| r.applied).sum();
                    if applied > 0 {
                        event!(Level::DEBUG, applied, views = reports.len(), "index worker pass");
                    }
                }
                Err(err) => {
                    event!(Level::WARN, error = %err, "index worker pass failed");
                }
            }
        }
        event!(Level::INFO, "index worker stopped");
    });

    IndexWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::{Document, Value};
    use crate::projection::{EmissionBuffer, ProjectionResult};
    use crate::storage::MemoryDocumentStore;
    use crate::view::ViewDefinition;
    use std::time::Duration;

    fn by_status(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
        if let Some(status) = doc.get_str("status") {
            out.emit(status, Value::Null);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_worker_follows_store_changes() {
        let store = Arc::new(MemoryDocumentStore::new());
        let engine = Arc::new(IndexEngine::new(
            store.clone(),
            EngineConfig::new().poll_interval(Duration::from_secs(60)),
        ));
        engine
            .register_view(ViewDefinition::from_fn("sample/status", by_status))
            .await
            .unwrap();

        let worker = spawn_index_worker(engine.clone());
        let seq = store
            .put(Document::new("s1", Some("sample")).with_field("status", "NEW"))
            .await;

        let mut rx = engine.subscribe("sample/status").unwrap();
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow_and_update().watermark() >= seq {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(reached.is_ok());
        assert_eq!(engine.snapshot("sample/status").unwrap().len(), 1);

        worker.stop().await.unwrap();
    }
}
