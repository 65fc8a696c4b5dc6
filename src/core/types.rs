use super::{IndexError, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of a document in the external store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(pub String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Monotonically increasing revision marker of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Revision(pub u64);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in the document store's change feed.
///
/// `ChangeSeq::ZERO` means "nothing applied yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct ChangeSeq(pub u64);

impl ChangeSeq {
    pub const ZERO: ChangeSeq = ChangeSeq(0);

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for ChangeSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: ChangeSeq,
    pub doc_id: DocId,
}

impl ChangeEvent {
    pub fn new(seq: u64, doc_id: impl Into<DocId>) -> Self {
        Self {
            seq: ChangeSeq(seq),
            doc_id: doc_id.into(),
        }
    }
}

/// A document as handed out by the store. The engine only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub revision: Revision,
    pub doctype: Option<String>,
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<DocId>, doctype: Option<&str>) -> Self {
        Self {
            id: id.into(),
            revision: Revision::default(),
            doctype: doctype.map(str::to_string),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = revision;
        self
    }

    /// Builds a document from a JSON object.
    ///
    /// The id comes from `_id` (or `id`), the revision from a numeric `_rev`
    /// and the doctype from `doctype_field`. Remaining fields are kept as-is,
    /// including the doctype field itself.
    pub fn from_json(json: serde_json::Value, doctype_field: &str) -> Result<Self> {
        let serde_json::Value::Object(map) = json else {
            return Err(IndexError::DocumentStore(
                "document must be a JSON object".to_string(),
            ));
        };

        let id = map
            .get("_id")
            .or_else(|| map.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| IndexError::DocumentStore("document has no '_id'".to_string()))?
            .to_string();
        let revision = map
            .get("_rev")
            .and_then(|v| v.as_u64())
            .map(Revision)
            .unwrap_or_default();
        let doctype = map
            .get(doctype_field)
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let fields = map
            .into_iter()
            .filter(|(k, _)| k != "_id" && k != "_rev")
            .map(|(k, v)| (k, Value::from(v)))
            .collect();

        Ok(Self {
            id: DocId(id),
            revision,
            doctype,
            fields,
        })
    }

    pub fn is_doctype(&self, doctype: &str) -> bool {
        self.doctype.as_deref() == Some(doctype)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Non-empty string field, mirroring the `if (!doc.name) return;` guard.
    pub fn get_nonempty_str(&self, field: &str) -> Option<&str> {
        self.get_str(field).filter(|s| !s.is_empty())
    }

    pub fn get_array(&self, field: &str) -> Option<&[Value]> {
        self.fields.get(field).and_then(Value::as_array)
    }

    /// The whole document as an object value, with `_id` and `_rev` restored.
    pub fn to_value(&self) -> Value {
        let mut fields = self.fields.clone();
        fields.insert("_id".to_string(), Value::Text(self.id.0.clone()));
        fields.insert(
            "_rev".to_string(),
            Value::Integer(i64::try_from(self.revision.0).unwrap_or(i64::MAX)),
        );
        Value::Object(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_from_json() {
        let doc = Document::from_json(
            json!({"_id": "s1", "_rev": 3, "doctype": "sample", "projectid": "P1"}),
            "doctype",
        )
        .unwrap();
        assert_eq!(doc.id, DocId::new("s1"));
        assert_eq!(doc.revision, Revision(3));
        assert!(doc.is_doctype("sample"));
        assert_eq!(doc.get_str("projectid"), Some("P1"));
        assert!(doc.get("missing").is_none());
    }

    #[test]
    fn test_document_without_id_is_rejected() {
        let err = Document::from_json(json!({"doctype": "sample"}), "doctype").unwrap_err();
        assert!(matches!(err, IndexError::DocumentStore(_)));
    }

    #[test]
    fn test_null_fields_are_treated_as_missing() {
        let doc = Document::new("u1", Some("user")).with_field("email", Value::Null);
        assert!(doc.get("email").is_none());
        assert!(doc.get_str("email").is_none());
    }
}
