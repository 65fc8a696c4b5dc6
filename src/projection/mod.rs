// ============================================================================
// Projection contract
// ============================================================================
//
// A projection maps one document to zero or more (key, value) emissions.
// It must be deterministic for a given document content: the maintainer
// diffs old and new emission sets by running it again.
//
// Missing or malformed fields are not errors; the projection skips the
// emission. `ProjectionFailure` is reserved for unexpected failures, which
// the maintainer retries and eventually surfaces.
//
// ============================================================================

pub mod builtin;

use crate::core::{DocId, Document, Value};
use crate::storage::EntryKey;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Unexpected failure inside a projection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProjectionFailure {
    pub message: String,
}

impl ProjectionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type ProjectionResult = std::result::Result<(), ProjectionFailure>;

/// One `(key, value)` pair emitted while projecting a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub key: Value,
    pub value: Value,
}

/// Emissions of a single document, in emission order.
#[derive(Debug, Clone, Default)]
pub struct EmissionBuffer {
    emissions: Vec<Emission>,
}

impl EmissionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, key: impl Into<Value>, value: impl Into<Value>) {
        self.emissions.push(Emission {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.emissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emissions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Emission> {
        self.emissions.iter()
    }

    pub fn clear(&mut self) {
        self.emissions.clear();
    }

    /// Index entries for `doc_id`; the emission sequence number is the
    /// position in the buffer.
    pub fn into_entries(self, doc_id: &DocId) -> Vec<(EntryKey, Value)> {
        self.emissions
            .into_iter()
            .enumerate()
            .map(|(seq, e)| {
                let entry = EntryKey {
                    key: e.key,
                    doc_id: doc_id.clone(),
                    seq: u32::try_from(seq).unwrap_or(u32::MAX),
                };
                (entry, e.value)
            })
            .collect()
    }
}

/// Pure document-to-emissions function.
pub trait Projection: Send + Sync {
    fn project(&self, doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult;
}

impl<F> Projection for F
where
    F: Fn(&Document, &mut EmissionBuffer) -> ProjectionResult + Send + Sync,
{
    fn project(&self, doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
        self(doc, out)
    }
}

/// Runs `projection` against `doc` into a fresh buffer.
pub fn project_document(
    projection: &dyn Projection,
    doc: &Document,
) -> std::result::Result<EmissionBuffer, ProjectionFailure> {
    let mut out = EmissionBuffer::new();
    projection.project(doc, &mut out)?;
    Ok(out)
}

/// Dispatches a document to the strategy registered for its doctype.
///
/// Documents with no doctype, or one without a strategy, emit nothing.
#[derive(Clone, Default)]
pub struct DoctypeRouter {
    strategies: HashMap<String, Arc<dyn Projection>>,
}

impl DoctypeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, doctype: impl Into<String>, strategy: impl Projection + 'static) -> Self {
        self.strategies.insert(doctype.into(), Arc::new(strategy));
        self
    }

    pub fn route_fn<F>(self, doctype: impl Into<String>, strategy: F) -> Self
    where
        F: Fn(&Document, &mut EmissionBuffer) -> ProjectionResult + Send + Sync + 'static,
    {
        self.route(doctype, strategy)
    }

    pub fn doctypes(&self) -> impl Iterator<Item = &str> {
        self.strategies.keys().map(String::as_str)
    }
}

impl fmt::Debug for DoctypeRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut doctypes: Vec<_> = self.doctypes().collect();
        doctypes.sort_unstable();
        f.debug_struct("DoctypeRouter")
            .field("doctypes", &doctypes)
            .finish()
    }
}

impl Projection for DoctypeRouter {
    fn project(&self, doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
        match doc.doctype.as_deref().and_then(|t| self.strategies.get(t)) {
            Some(strategy) => strategy.project(doc, out),
            None => Ok(()),
        }
    }
}
