use crate::config::EngineConfig;
use crate::core::{ChangeEvent, ChangeSeq, DocId, Document, Result, Revision};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{RwLock, watch};

/// The external document store the engine indexes.
///
/// The change feed must be ordered by `seq` and replayable from any point.
/// Delivering the same event more than once is fine.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Current content of a document, `None` when it does not exist.
    async fn fetch(&self, id: &DocId) -> Result<Option<Document>>;

    /// Up to `limit` events with `seq > since`, in feed order.
    async fn changes_since(&self, since: ChangeSeq, limit: usize) -> Result<Vec<ChangeEvent>>;

    /// Identifier of the newest event in the feed.
    async fn latest_change(&self) -> Result<ChangeSeq>;

    /// Every live document, for full rebuilds.
    async fn scan_all(&self) -> Result<Vec<Document>>;

    /// Optional push notification carrying the newest change identifier.
    fn subscribe(&self) -> Option<watch::Receiver<ChangeSeq>> {
        None
    }
}

#[derive(Debug, Default)]
struct StoreState {
    docs: HashMap<DocId, Document>,
    log: Vec<ChangeEvent>,
    last: ChangeSeq,
}

impl StoreState {
    fn record(&mut self, doc_id: DocId) -> ChangeSeq {
        self.last = self.last.next();
        self.log.push(ChangeEvent {
            seq: self.last,
            doc_id,
        });
        self.last
    }
}

/// In-process document store with an append-only change log.
#[derive(Debug)]
pub struct MemoryDocumentStore {
    state: RwLock<StoreState>,
    notify: watch::Sender<ChangeSeq>,
    doctype_field: String,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::with_doctype_field("doctype")
    }

    /// Store reading the doctype from `config.doctype_field`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::with_doctype_field(config.doctype_field.clone())
    }

    pub fn with_doctype_field(field: impl Into<String>) -> Self {
        let (notify, _) = watch::channel(ChangeSeq::ZERO);
        Self {
            state: RwLock::new(StoreState::default()),
            notify,
            doctype_field: field.into(),
        }
    }

    /// Stores a document, bumping its revision; returns the change identifier.
    pub async fn put(&self, mut doc: Document) -> ChangeSeq {
        let seq = {
            let mut state = self.state.write().await;
            let previous = state
                .docs
                .get(&doc.id)
                .map(|d| d.revision)
                .unwrap_or_default();
            doc.revision = Revision(previous.0.max(doc.revision.0) + 1);
            let id = doc.id.clone();
            state.docs.insert(id.clone(), doc);
            state.record(id)
        };
        self.notify.send_replace(seq);
        seq
    }

    pub async fn put_json(&self, json: serde_json::Value) -> Result<ChangeSeq> {
        let doc = Document::from_json(json, &self.doctype_field)?;
        Ok(self.put(doc).await)
    }

    /// Removes a document. Returns `None` when there was nothing to delete.
    pub async fn delete(&self, id: &DocId) -> Option<ChangeSeq> {
        let seq = {
            let mut state = self.state.write().await;
            state.docs.remove(id)?;
            state.record(id.clone())
        };
        self.notify.send_replace(seq);
        Some(seq)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn fetch(&self, id: &DocId) -> Result<Option<Document>> {
        Ok(self.state.read().await.docs.get(id).cloned())
    }

    async fn changes_since(&self, since: ChangeSeq, limit: usize) -> Result<Vec<ChangeEvent>> {
        let state = self.state.read().await;
        let start = state.log.partition_point(|e| e.seq <= since);
        Ok(state.log[start..].iter().take(limit).cloned().collect())
    }

    async fn latest_change(&self) -> Result<ChangeSeq> {
        Ok(self.state.read().await.last)
    }

    async fn scan_all(&self) -> Result<Vec<Document>> {
        let state = self.state.read().await;
        let mut docs: Vec<Document> = state.docs.values().cloned().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    fn subscribe(&self) -> Option<watch::Receiver<ChangeSeq>> {
        Some(self.notify.subscribe())
    }
}
