use super::tree::{EntryKey, SortedIndex};
use crate::core::{ChangeSeq, DocId, Value};
use crate::reduce::Combiner;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Outcome of replacing one document's emissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub inserted: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl DiffStats {
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.removed == 0
    }
}

/// One view's materialized state: the sorted index with its reduce overlay,
/// the per-document side index and the applied-change watermark.
///
/// Every field is persistent, so `clone()` is cheap and a published clone
/// stays valid while the writer keeps mutating its own copy.
#[derive(Debug, Clone)]
pub struct ViewIndex {
    tree: SortedIndex,
    by_doc: im::HashMap<DocId, Vec<EntryKey>>,
    watermark: ChangeSeq,
}

impl ViewIndex {
    pub fn new(combiner: Option<Arc<dyn Combiner>>) -> Self {
        Self {
            tree: SortedIndex::new(combiner),
            by_doc: im::HashMap::new(),
            watermark: ChangeSeq::ZERO,
        }
    }

    /// Rebuilds an index from entries in key order, as read from a
    /// checkpoint. Fails when the entries are not strictly ascending.
    pub fn from_entries(
        entries: Vec<(EntryKey, Value)>,
        combiner: Option<Arc<dyn Combiner>>,
        watermark: ChangeSeq,
    ) -> std::result::Result<Self, String> {
        if let Some(pos) = entries.windows(2).position(|w| w[0].0 >= w[1].0) {
            return Err(format!(
                "entries not strictly ascending at position {}",
                pos + 1
            ));
        }

        let mut grouped: HashMap<DocId, Vec<EntryKey>> = HashMap::new();
        for (entry, _) in &entries {
            grouped
                .entry(entry.doc_id.clone())
                .or_default()
                .push(entry.clone());
        }
        let by_doc = grouped
            .into_iter()
            .map(|(doc_id, mut keys)| {
                keys.sort_by_key(|k| k.seq);
                (doc_id, keys)
            })
            .collect();

        Ok(Self {
            tree: SortedIndex::from_sorted(entries, combiner),
            by_doc,
            watermark,
        })
    }

    pub fn tree(&self) -> &SortedIndex {
        &self.tree
    }

    pub fn watermark(&self) -> ChangeSeq {
        self.watermark
    }

    /// Watermarks never move backwards.
    pub fn advance_watermark(&mut self, seq: ChangeSeq) {
        if seq > self.watermark {
            self.watermark = seq;
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Number of documents with at least one entry.
    pub fn documents(&self) -> usize {
        self.by_doc.len()
    }

    /// Current entries of one document, in emission order.
    pub fn entries_for(&self, doc_id: &DocId) -> Vec<(EntryKey, Value)> {
        self.by_doc
            .get(doc_id)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.tree.get(k).map(|v| (k.clone(), v.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replaces the entries of `doc_id` with `emissions`.
    ///
    /// Entries whose key and value are unchanged are not touched, so their
    /// cached aggregates are not recomputed.
    pub fn apply_document(
        &mut self,
        doc_id: &DocId,
        emissions: Vec<(EntryKey, Value)>,
    ) -> DiffStats {
        let mut stats = DiffStats::default();
        let new_keys: Vec<EntryKey> = emissions.iter().map(|(k, _)| k.clone()).collect();
        let mut pending: BTreeMap<EntryKey, Value> = emissions.into_iter().collect();

        let old_keys = self.by_doc.get(doc_id).cloned().unwrap_or_default();
        for key in &old_keys {
            match pending.get(key) {
                Some(value) if self.tree.get(key).is_some_and(|cur| cur.identical(value)) => {
                    pending.remove(key);
                    stats.unchanged += 1;
                }
                // Same position, new value: the insert below replaces it.
                Some(_) => {}
                None => {
                    if self.tree.remove(key).is_some() {
                        stats.removed += 1;
                    }
                }
            }
        }

        for (key, value) in pending {
            self.tree.insert(key, value);
            stats.inserted += 1;
        }

        if new_keys.is_empty() {
            self.by_doc.remove(doc_id);
        } else {
            self.by_doc.insert(doc_id.clone(), new_keys);
        }
        stats
    }

    /// Checks the tree and that the side index covers exactly the tree.
    pub fn verify(&self) -> std::result::Result<(), String> {
        self.tree.verify()?;

        let mut indexed = 0usize;
        for (doc_id, keys) in self.by_doc.iter() {
            for key in keys {
                if &key.doc_id != doc_id {
                    return Err(format!("entry {:?} filed under document '{}'", key, doc_id));
                }
                if self.tree.get(key).is_none() {
                    return Err(format!("side index references missing entry {:?}", key));
                }
            }
            indexed += keys.len();
        }
        if indexed != self.tree.len() {
            return Err(format!(
                "side index covers {} entries, tree holds {}",
                indexed,
                self.tree.len()
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn tree_mut(&mut self) -> &mut SortedIndex {
        &mut self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::{Aggregate, CountCombiner};

    fn emission(key: &str, doc: &str, seq: u32, value: i64) -> (EntryKey, Value) {
        (EntryKey::new(key, doc, seq), Value::Integer(value))
    }

    fn counted() -> ViewIndex {
        ViewIndex::new(Some(Arc::new(CountCombiner)))
    }

    #[test]
    fn test_update_replaces_document_entries() {
        let mut index = counted();
        let doc = DocId::new("s1");
        index.apply_document(&doc, vec![emission("a", "s1", 0, 1), emission("b", "s1", 1, 1)]);
        let stats = index.apply_document(&doc, vec![emission("b", "s1", 0, 1), emission("c", "s1", 1, 1)]);

        // ("b", seq 1) moved to seq 0, so nothing survives unchanged.
        assert_eq!(stats, DiffStats { inserted: 2, removed: 2, unchanged: 0 });
        let keys: Vec<_> = index.entries_for(&doc).into_iter().map(|(k, _)| k.key).collect();
        assert_eq!(keys, vec![Value::from("b"), Value::from("c")]);
        assert_eq!(index.len(), 2);
        index.verify().unwrap();
    }

    #[test]
    fn test_unchanged_emissions_are_left_alone() {
        let mut index = counted();
        let doc = DocId::new("s1");
        index.apply_document(&doc, vec![emission("a", "s1", 0, 1), emission("b", "s1", 1, 1)]);
        let stats = index.apply_document(&doc, vec![emission("a", "s1", 0, 1), emission("b", "s1", 1, 2)]);
        assert_eq!(stats, DiffStats { inserted: 1, removed: 0, unchanged: 1 });

        let again = index.apply_document(&doc, vec![emission("a", "s1", 0, 1), emission("b", "s1", 1, 2)]);
        assert!(again.is_noop());
        index.verify().unwrap();
    }

    #[test]
    fn test_integer_to_float_value_change_is_applied() {
        let mut index = counted();
        let doc = DocId::new("p1");
        index.apply_document(&doc, vec![(EntryKey::new("k", "p1", 0), Value::Integer(1))]);
        let stats = index.apply_document(&doc, vec![(EntryKey::new("k", "p1", 0), Value::Float(1.0))]);
        assert_eq!(stats.inserted, 1);
        let stored = index.tree().get(&EntryKey::new("k", "p1", 0)).cloned();
        assert!(matches!(stored, Some(Value::Float(_))));
    }

    #[test]
    fn test_empty_emissions_drop_document() {
        let mut index = counted();
        let doc = DocId::new("s1");
        index.apply_document(&doc, vec![emission("a", "s1", 0, 1)]);
        index.apply_document(&DocId::new("s2"), vec![emission("a", "s2", 0, 1)]);
        let stats = index.apply_document(&doc, Vec::new());
        assert_eq!(stats.removed, 1);
        assert_eq!(index.documents(), 1);
        assert_eq!(index.tree().total(), Aggregate::Integer(1));
    }

    #[test]
    fn test_from_entries_rejects_unsorted_input() {
        let entries = vec![emission("b", "x", 0, 1), emission("a", "x", 1, 1)];
        assert!(ViewIndex::from_entries(entries, None, ChangeSeq(3)).is_err());

        let entries = vec![emission("a", "x", 1, 1), emission("b", "x", 0, 1)];
        let index = ViewIndex::from_entries(entries, None, ChangeSeq(3)).unwrap();
        assert_eq!(index.watermark(), ChangeSeq(3));
        let keys: Vec<_> = index
            .entries_for(&DocId::new("x"))
            .into_iter()
            .map(|(k, _)| k.seq)
            .collect();
        assert_eq!(keys, vec![0, 1]);
        index.verify().unwrap();
    }

    #[test]
    fn test_watermark_is_monotone() {
        let mut index = counted();
        index.advance_watermark(ChangeSeq(5));
        index.advance_watermark(ChangeSeq(3));
        assert_eq!(index.watermark(), ChangeSeq(5));
    }
}
