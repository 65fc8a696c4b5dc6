//! Ordered range scans over a view snapshot.

use crate::core::{ChangeSeq, DocId, Document, IndexError, Result, Value};
use crate::storage::{EntryKey, ViewIndex};
use crate::view::Freshness;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

/// One end of a key range.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum KeyBound {
    #[default]
    Unbounded,
    Included(Value),
    Excluded(Value),
    /// The array `parts` and every array key that starts with `parts`.
    Prefix(Vec<Value>),
}

impl KeyBound {
    fn anchor(&self) -> Option<Value> {
        match self {
            KeyBound::Unbounded => None,
            KeyBound::Included(v) | KeyBound::Excluded(v) => Some(v.clone()),
            KeyBound::Prefix(parts) => Some(Value::Array(parts.clone())),
        }
    }

    /// Monotone `false..true` predicate: key lies at or above this bound.
    pub(crate) fn admits_from_below(&self, key: &Value) -> bool {
        match self {
            KeyBound::Unbounded => true,
            KeyBound::Included(v) => key >= v,
            KeyBound::Excluded(v) => key > v,
            KeyBound::Prefix(parts) => key.collate(&Value::Array(parts.clone())).is_ge(),
        }
    }

    /// Monotone `true..false` predicate: key lies at or below this bound.
    pub(crate) fn admits_from_above(&self, key: &Value) -> bool {
        match self {
            KeyBound::Unbounded => true,
            KeyBound::Included(v) => key <= v,
            KeyBound::Excluded(v) => key < v,
            KeyBound::Prefix(parts) => {
                key.has_prefix(parts) || key.collate(&Value::Array(parts.clone())).is_le()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

impl Order {
    pub fn is_descending(self) -> bool {
        self == Order::Descending
    }
}

/// Key range in ascending terms, after the start/end swap of descending
/// queries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyRange {
    pub lower: KeyBound,
    pub upper: KeyBound,
}

impl KeyRange {
    pub fn new(lower: KeyBound, upper: KeyBound) -> Self {
        Self { lower, upper }
    }

    /// Builds the range from bounds given in iteration order.
    pub fn from_iteration_order(start: KeyBound, end: KeyBound, order: Order) -> Self {
        match order {
            Order::Ascending => Self::new(start, end),
            Order::Descending => Self::new(end, start),
        }
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.lower.admits_from_below(key) && self.upper.admits_from_above(key)
    }

    /// Fails with `InvalidRange` when the lower bound sorts after the upper.
    pub fn validate(&self) -> Result<()> {
        let (Some(lo), Some(hi)) = (self.lower.anchor(), self.upper.anchor()) else {
            return Ok(());
        };
        if lo <= hi {
            return Ok(());
        }
        if let KeyBound::Prefix(parts) = &self.upper
            && lo.has_prefix(parts)
        {
            return Ok(());
        }
        Err(IndexError::InvalidRange(format!(
            "start {} sorts after end {}",
            lo, hi
        )))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RangeQuery {
    /// First bound in iteration order.
    pub start: KeyBound,
    /// Last bound in iteration order.
    pub end: KeyBound,
    pub order: Order,
    pub limit: Option<usize>,
    /// Resume token from a previous page.
    pub cursor: Option<String>,
    pub freshness: Freshness,
    /// Attach the emitting document to every row.
    pub include_docs: bool,
}

impl RangeQuery {
    pub fn all() -> Self {
        Self::default()
    }

    /// Entries whose key equals `key`.
    pub fn key(key: impl Into<Value>) -> Self {
        let key = key.into();
        Self {
            start: KeyBound::Included(key.clone()),
            end: KeyBound::Included(key),
            ..Self::default()
        }
    }

    /// Array keys starting with `parts`.
    pub fn prefix(parts: Vec<Value>) -> Self {
        Self {
            start: KeyBound::Prefix(parts.clone()),
            end: KeyBound::Prefix(parts),
            ..Self::default()
        }
    }

    /// Keys from `start` to `end`, both included.
    pub fn between(start: impl Into<Value>, end: impl Into<Value>) -> Self {
        Self {
            start: KeyBound::Included(start.into()),
            end: KeyBound::Included(end.into()),
            ..Self::default()
        }
    }

    pub fn with_start(mut self, start: KeyBound) -> Self {
        self.start = start;
        self
    }

    pub fn with_end(mut self, end: KeyBound) -> Self {
        self.end = end;
        self
    }

    /// Flips the direction, keeping the same set of keys.
    pub fn descending(mut self) -> Self {
        if self.order == Order::Ascending {
            std::mem::swap(&mut self.start, &mut self.end);
            self.order = Order::Descending;
        }
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn include_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }

    pub fn range(&self) -> KeyRange {
        KeyRange::from_iteration_order(self.start.clone(), self.end.clone(), self.order)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeRow {
    pub key: Value,
    pub value: Value,
    pub doc_id: DocId,
    /// The document as the store holds it when the page is returned; only
    /// filled for `include_docs` queries. `None` when it has been deleted
    /// since the snapshot was taken.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RangePage {
    pub rows: Vec<RangeRow>,
    /// Entries in the whole view.
    pub total_rows: usize,
    /// Watermark of the snapshot the page was read from.
    pub watermark: ChangeSeq,
    /// Present when more rows follow.
    pub next_cursor: Option<String>,
}

// ============================================================================
// Resume cursors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CursorToken {
    view: String,
    descending: bool,
    last: EntryKey,
}

pub(crate) fn encode_cursor(view: &str, order: Order, last: &EntryKey) -> Result<String> {
    let token = CursorToken {
        view: view.to_string(),
        descending: order.is_descending(),
        last: last.clone(),
    };
    let bytes = rmp_serde::to_vec(&token)
        .map_err(|e| IndexError::Serialization(format!("Failed to encode cursor: {}", e)))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

pub(crate) fn decode_cursor(view: &str, order: Order, encoded: &str) -> Result<EntryKey> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| IndexError::InvalidCursor("not a cursor".to_string()))?;
    let token: CursorToken = rmp_serde::from_slice(&bytes)
        .map_err(|_| IndexError::InvalidCursor("not a cursor".to_string()))?;
    if token.view != view {
        return Err(IndexError::InvalidCursor(format!(
            "cursor belongs to view '{}'",
            token.view
        )));
    }
    if token.descending != order.is_descending() {
        return Err(IndexError::InvalidCursor(
            "cursor was issued for the opposite order".to_string(),
        ));
    }
    Ok(token.last)
}

// ============================================================================
// Execution
// ============================================================================

/// Runs a range query against one snapshot.
pub fn execute_range(view: &str, index: &ViewIndex, query: &RangeQuery) -> Result<RangePage> {
    let range = query.range();
    range.validate()?;
    let resume = query
        .cursor
        .as_deref()
        .map(|c| decode_cursor(view, query.order, c))
        .transpose()?;

    let mut page = RangePage {
        rows: Vec::new(),
        total_rows: index.len(),
        watermark: index.watermark(),
        next_cursor: None,
    };
    if query.limit == Some(0) {
        return Ok(page);
    }
    let fetch = query.limit.map(|l| l.saturating_add(1)).unwrap_or(usize::MAX);

    let tree = index.tree();
    let mut picked: Vec<(&EntryKey, &Value)> = match query.order {
        Order::Ascending => tree
            .seek_ascending(|e| {
                range.lower.admits_from_below(&e.key) && resume.as_ref().is_none_or(|r| e > r)
            })
            .take_while(|(e, _)| range.upper.admits_from_above(&e.key))
            .take(fetch)
            .collect(),
        Order::Descending => tree
            .seek_descending(|e| {
                range.upper.admits_from_above(&e.key) && resume.as_ref().is_none_or(|r| e < r)
            })
            .take_while(|(e, _)| range.lower.admits_from_below(&e.key))
            .take(fetch)
            .collect(),
    };

    if let Some(limit) = query.limit
        && picked.len() > limit
    {
        picked.truncate(limit);
        if let Some((last, _)) = picked.last() {
            page.next_cursor = Some(encode_cursor(view, query.order, last)?);
        }
    }

    page.rows = picked
        .into_iter()
        .map(|(e, v)| RangeRow {
            key: e.key.clone(),
            value: v.clone(),
            doc_id: e.doc_id.clone(),
            doc: None,
        })
        .collect();
    Ok(page)
}
