// ============================================================================
// Persistent sorted index with cached aggregates
// ============================================================================
//
// A path-copying AVL tree. Every mutation rebuilds only the nodes on the
// path to the changed entry and shares the rest, so cloning an index is an
// `Arc` clone and a clone taken before a mutation never observes it.
//
// Each node caches the height, the size and the aggregate of its subtree
// (in key order: left, self, right). A range fold uses the cached
// aggregate of every subtree that lies fully inside the range.
//
// Range predicates are monotone over the key order:
//   lower(k): false ... false true ... true
//   upper(k): true  ... true false ... false
//
// ============================================================================

use crate::core::{DocId, Value};
use crate::reduce::{Aggregate, Combiner};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Position of one emission in a view: emitted key, then source document,
/// then the emission's sequence number within that document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    pub key: Value,
    pub doc_id: DocId,
    pub seq: u32,
}

impl EntryKey {
    pub fn new(key: impl Into<Value>, doc_id: impl Into<DocId>, seq: u32) -> Self {
        Self {
            key: key.into(),
            doc_id: doc_id.into(),
            seq,
        }
    }
}

type Link = Option<Arc<Node>>;

static EMPTY_AGGREGATE: Aggregate = Aggregate::Empty;

#[derive(Debug)]
struct Node {
    entry: EntryKey,
    value: Value,
    height: u8,
    size: usize,
    agg: Aggregate,
    left: Link,
    right: Link,
}

fn height(link: &Link) -> u8 {
    link.as_ref().map_or(0, |n| n.height)
}

fn size(link: &Link) -> usize {
    link.as_ref().map_or(0, |n| n.size)
}

fn aggregate(link: &Link) -> &Aggregate {
    link.as_ref().map_or(&EMPTY_AGGREGATE, |n| &n.agg)
}

fn node(
    entry: EntryKey,
    value: Value,
    left: Link,
    right: Link,
    comb: Option<&dyn Combiner>,
) -> Arc<Node> {
    let agg = match comb {
        Some(c) => {
            let own = Aggregate::leaf(c, &entry.key, &value);
            aggregate(&left).merge(&own, c).merge(aggregate(&right), c)
        }
        None => Aggregate::Empty,
    };
    Arc::new(Node {
        height: 1 + height(&left).max(height(&right)),
        size: 1 + size(&left) + size(&right),
        agg,
        entry,
        value,
        left,
        right,
    })
}

fn balance(
    entry: EntryKey,
    value: Value,
    left: Link,
    right: Link,
    comb: Option<&dyn Combiner>,
) -> Arc<Node> {
    let hl = height(&left);
    let hr = height(&right);

    if hl > hr + 1 {
        if let Some(l) = &left {
            if height(&l.left) >= height(&l.right) {
                let new_right = node(entry, value, l.right.clone(), right, comb);
                return node(
                    l.entry.clone(),
                    l.value.clone(),
                    l.left.clone(),
                    Some(new_right),
                    comb,
                );
            }
            if let Some(lr) = &l.right {
                let new_left = node(
                    l.entry.clone(),
                    l.value.clone(),
                    l.left.clone(),
                    lr.left.clone(),
                    comb,
                );
                let new_right = node(entry, value, lr.right.clone(), right, comb);
                return node(
                    lr.entry.clone(),
                    lr.value.clone(),
                    Some(new_left),
                    Some(new_right),
                    comb,
                );
            }
        }
    } else if hr > hl + 1
        && let Some(r) = &right
    {
        if height(&r.right) >= height(&r.left) {
            let new_left = node(entry, value, left, r.left.clone(), comb);
            return node(
                r.entry.clone(),
                r.value.clone(),
                Some(new_left),
                r.right.clone(),
                comb,
            );
        }
        if let Some(rl) = &r.left {
            let new_left = node(entry, value, left, rl.left.clone(), comb);
            let new_right = node(
                r.entry.clone(),
                r.value.clone(),
                rl.right.clone(),
                r.right.clone(),
                comb,
            );
            return node(
                rl.entry.clone(),
                rl.value.clone(),
                Some(new_left),
                Some(new_right),
                comb,
            );
        }
    }

    node(entry, value, left, right, comb)
}

fn insert_at(
    link: &Link,
    entry: EntryKey,
    value: Value,
    comb: Option<&dyn Combiner>,
    replaced: &mut Option<Value>,
) -> Arc<Node> {
    let Some(n) = link else {
        return node(entry, value, None, None, comb);
    };
    match entry.cmp(&n.entry) {
        Ordering::Less => {
            let left = insert_at(&n.left, entry, value, comb, replaced);
            balance(
                n.entry.clone(),
                n.value.clone(),
                Some(left),
                n.right.clone(),
                comb,
            )
        }
        Ordering::Greater => {
            let right = insert_at(&n.right, entry, value, comb, replaced);
            balance(
                n.entry.clone(),
                n.value.clone(),
                n.left.clone(),
                Some(right),
                comb,
            )
        }
        Ordering::Equal => {
            *replaced = Some(n.value.clone());
            node(entry, value, n.left.clone(), n.right.clone(), comb)
        }
    }
}

fn remove_at(
    link: &Link,
    key: &EntryKey,
    comb: Option<&dyn Combiner>,
    removed: &mut Option<Value>,
) -> Link {
    let n = link.as_ref()?;
    match key.cmp(&n.entry) {
        Ordering::Less => {
            let left = remove_at(&n.left, key, comb, removed);
            if removed.is_none() {
                return link.clone();
            }
            Some(balance(
                n.entry.clone(),
                n.value.clone(),
                left,
                n.right.clone(),
                comb,
            ))
        }
        Ordering::Greater => {
            let right = remove_at(&n.right, key, comb, removed);
            if removed.is_none() {
                return link.clone();
            }
            Some(balance(
                n.entry.clone(),
                n.value.clone(),
                n.left.clone(),
                right,
                comb,
            ))
        }
        Ordering::Equal => {
            *removed = Some(n.value.clone());
            match (&n.left, &n.right) {
                (None, None) => None,
                (Some(_), None) => n.left.clone(),
                (None, Some(_)) => n.right.clone(),
                (Some(_), Some(r)) => {
                    let (entry, value, rest) = remove_min(r, comb);
                    Some(balance(entry, value, n.left.clone(), rest, comb))
                }
            }
        }
    }
}

fn remove_min(n: &Arc<Node>, comb: Option<&dyn Combiner>) -> (EntryKey, Value, Link) {
    match &n.left {
        None => (n.entry.clone(), n.value.clone(), n.right.clone()),
        Some(l) => {
            let (entry, value, rest) = remove_min(l, comb);
            let rebuilt = balance(
                n.entry.clone(),
                n.value.clone(),
                rest,
                n.right.clone(),
                comb,
            );
            (entry, value, Some(rebuilt))
        }
    }
}

fn fold_at(
    link: Option<&Node>,
    lower: &dyn Fn(&EntryKey) -> bool,
    upper: &dyn Fn(&EntryKey) -> bool,
    lower_open: bool,
    upper_open: bool,
    comb: &dyn Combiner,
) -> Aggregate {
    let Some(n) = link else {
        return Aggregate::Empty;
    };
    if lower_open && upper_open {
        return n.agg.clone();
    }
    if !lower_open && !lower(&n.entry) {
        return fold_at(n.right.as_deref(), lower, upper, lower_open, upper_open, comb);
    }
    if !upper_open && !upper(&n.entry) {
        return fold_at(n.left.as_deref(), lower, upper, lower_open, upper_open, comb);
    }
    // n is inside the range: everything left of it is below the upper
    // bound, everything right of it above the lower bound.
    let left = fold_at(n.left.as_deref(), lower, upper, lower_open, true, comb);
    let right = fold_at(n.right.as_deref(), lower, upper, true, upper_open, comb);
    let own = Aggregate::leaf(comb, &n.entry.key, &n.value);
    left.merge(&own, comb).merge(&right, comb)
}

fn build_balanced(
    entries: &mut impl Iterator<Item = (EntryKey, Value)>,
    count: usize,
    comb: Option<&dyn Combiner>,
) -> Link {
    if count == 0 {
        return None;
    }
    let left_count = (count - 1) / 2;
    let left = build_balanced(entries, left_count, comb);
    let (entry, value) = entries.next()?;
    let right = build_balanced(entries, count - 1 - left_count, comb);
    Some(node(entry, value, left, right, comb))
}

struct Checked {
    height: u8,
    size: usize,
    agg: Aggregate,
}

fn check_at(
    link: Option<&Node>,
    comb: Option<&dyn Combiner>,
    lower: Option<&EntryKey>,
    upper: Option<&EntryKey>,
) -> std::result::Result<Checked, String> {
    let Some(n) = link else {
        return Ok(Checked {
            height: 0,
            size: 0,
            agg: Aggregate::Empty,
        });
    };
    if let Some(lo) = lower
        && n.entry <= *lo
    {
        return Err(format!("entry {:?} is out of order", n.entry));
    }
    if let Some(hi) = upper
        && n.entry >= *hi
    {
        return Err(format!("entry {:?} is out of order", n.entry));
    }

    let left = check_at(n.left.as_deref(), comb, lower, Some(&n.entry))?;
    let right = check_at(n.right.as_deref(), comb, Some(&n.entry), upper)?;

    if left.height.abs_diff(right.height) > 1 {
        return Err(format!("subtree at {:?} is unbalanced", n.entry));
    }
    let height = 1 + left.height.max(right.height);
    if n.height != height {
        return Err(format!(
            "cached height {} at {:?}, expected {}",
            n.height, n.entry, height
        ));
    }
    let size = 1 + left.size + right.size;
    if n.size != size {
        return Err(format!(
            "cached size {} at {:?}, expected {}",
            n.size, n.entry, size
        ));
    }
    let agg = match comb {
        Some(c) => {
            let own = Aggregate::leaf(c, &n.entry.key, &n.value);
            left.agg.merge(&own, c).merge(&right.agg, c)
        }
        None => Aggregate::Empty,
    };
    if n.agg != agg {
        return Err(format!(
            "cached aggregate {:?} at {:?}, expected {:?}",
            n.agg, n.entry, agg
        ));
    }
    Ok(Checked { height, size, agg })
}

/// Ordered map `EntryKey -> Value` with copy-on-write snapshots and an
/// optional reduce overlay.
#[derive(Clone)]
pub struct SortedIndex {
    root: Link,
    combiner: Option<Arc<dyn Combiner>>,
}

impl SortedIndex {
    pub fn new(combiner: Option<Arc<dyn Combiner>>) -> Self {
        Self {
            root: None,
            combiner,
        }
    }

    /// Builds a balanced index from entries already in strictly ascending
    /// order. The caller checks the order.
    pub fn from_sorted(
        entries: Vec<(EntryKey, Value)>,
        combiner: Option<Arc<dyn Combiner>>,
    ) -> Self {
        let count = entries.len();
        let mut iter = entries.into_iter();
        let root = build_balanced(&mut iter, count, combiner.as_deref());
        Self { root, combiner }
    }

    pub fn combiner(&self) -> Option<&Arc<dyn Combiner>> {
        self.combiner.as_ref()
    }

    pub fn len(&self) -> usize {
        size(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn height(&self) -> u8 {
        height(&self.root)
    }

    /// Inserts or replaces; returns the replaced value.
    pub fn insert(&mut self, entry: EntryKey, value: Value) -> Option<Value> {
        let mut replaced = None;
        let root = insert_at(
            &self.root,
            entry,
            value,
            self.combiner.as_deref(),
            &mut replaced,
        );
        self.root = Some(root);
        replaced
    }

    pub fn remove(&mut self, entry: &EntryKey) -> Option<Value> {
        let mut removed = None;
        let root = remove_at(&self.root, entry, self.combiner.as_deref(), &mut removed);
        if removed.is_some() {
            self.root = root;
        }
        removed
    }

    pub fn get(&self, entry: &EntryKey) -> Option<&Value> {
        let mut cur = self.root.as_deref();
        while let Some(n) = cur {
            match entry.cmp(&n.entry) {
                Ordering::Less => cur = n.left.as_deref(),
                Ordering::Greater => cur = n.right.as_deref(),
                Ordering::Equal => return Some(&n.value),
            }
        }
        None
    }

    /// Aggregate of the whole index.
    pub fn total(&self) -> Aggregate {
        aggregate(&self.root).clone()
    }

    /// All entries in ascending order.
    pub fn iter(&self) -> Entries<'_> {
        self.seek_ascending(|_| true)
    }

    /// Ascending iteration from the first entry satisfying `lower`.
    pub fn seek_ascending<F>(&self, lower: F) -> Entries<'_>
    where
        F: Fn(&EntryKey) -> bool,
    {
        let mut stack = Vec::with_capacity(self.height() as usize);
        let mut cur = self.root.as_deref();
        while let Some(n) = cur {
            if lower(&n.entry) {
                stack.push(n);
                cur = n.left.as_deref();
            } else {
                cur = n.right.as_deref();
            }
        }
        Entries {
            stack,
            descending: false,
        }
    }

    /// Descending iteration from the last entry satisfying `upper`.
    pub fn seek_descending<F>(&self, upper: F) -> Entries<'_>
    where
        F: Fn(&EntryKey) -> bool,
    {
        let mut stack = Vec::with_capacity(self.height() as usize);
        let mut cur = self.root.as_deref();
        while let Some(n) = cur {
            if upper(&n.entry) {
                stack.push(n);
                cur = n.right.as_deref();
            } else {
                cur = n.left.as_deref();
            }
        }
        Entries {
            stack,
            descending: true,
        }
    }

    /// First entry satisfying the monotone predicate `lower`.
    pub fn first_where<F>(&self, lower: F) -> Option<(&EntryKey, &Value)>
    where
        F: Fn(&EntryKey) -> bool,
    {
        let mut best = None;
        let mut cur = self.root.as_deref();
        while let Some(n) = cur {
            if lower(&n.entry) {
                best = Some((&n.entry, &n.value));
                cur = n.left.as_deref();
            } else {
                cur = n.right.as_deref();
            }
        }
        best
    }

    /// Aggregate of the entries satisfying both `lower` and `upper`.
    ///
    /// Returns `Aggregate::Empty` when the index has no combiner.
    pub fn fold<L, U>(&self, lower: L, upper: U) -> Aggregate
    where
        L: Fn(&EntryKey) -> bool,
        U: Fn(&EntryKey) -> bool,
    {
        match self.combiner.as_deref() {
            Some(comb) => fold_at(self.root.as_deref(), &lower, &upper, false, false, comb),
            None => Aggregate::Empty,
        }
    }

    /// Recomputes every cached field and checks ordering and balance.
    pub fn verify(&self) -> std::result::Result<(), String> {
        check_at(self.root.as_deref(), self.combiner.as_deref(), None, None).map(|_| ())
    }

    /// Replaces the root's cached aggregate, leaving the entries untouched.
    #[cfg(test)]
    pub(crate) fn poison_root_aggregate(&mut self, agg: Aggregate) {
        if let Some(root) = &self.root {
            self.root = Some(Arc::new(Node {
                entry: root.entry.clone(),
                value: root.value.clone(),
                height: root.height,
                size: root.size,
                agg,
                left: root.left.clone(),
                right: root.right.clone(),
            }));
        }
    }
}

impl fmt::Debug for SortedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedIndex")
            .field("len", &self.len())
            .field("height", &self.height())
            .field("combiner", &self.combiner.as_ref().map(|c| c.name().to_string()))
            .finish()
    }
}

/// In-order walk over a borrowed index.
pub struct Entries<'a> {
    stack: Vec<&'a Node>,
    descending: bool,
}

impl<'a> Iterator for Entries<'a> {
    type Item = (&'a EntryKey, &'a Value);

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.stack.pop()?;
        if self.descending {
            let mut cur = n.left.as_deref();
            while let Some(m) = cur {
                self.stack.push(m);
                cur = m.right.as_deref();
            }
        } else {
            let mut cur = n.right.as_deref();
            while let Some(m) = cur {
                self.stack.push(m);
                cur = m.left.as_deref();
            }
        }
        Some((&n.entry, &n.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::{CountCombiner, OverflowPolicy, SumCombiner};
    use std::collections::BTreeMap;

    fn entry(key: i64, doc: &str) -> EntryKey {
        EntryKey::new(key, doc, 0)
    }

    // Deterministic permutation of 0..n (multiplicative step, n prime).
    fn scrambled(n: i64, step: i64) -> Vec<i64> {
        (0..n).map(|i| (i * step) % n).collect()
    }

    fn sum_index() -> SortedIndex {
        SortedIndex::new(Some(Arc::new(SumCombiner::new(None, OverflowPolicy::Checked))))
    }

    #[test]
    fn test_insert_remove_matches_btreemap() {
        let mut index = sum_index();
        let mut model = BTreeMap::new();

        for k in scrambled(211, 37) {
            let e = entry(k % 50, &format!("d{}", k));
            index.insert(e.clone(), Value::Integer(k));
            model.insert(e, k);
        }
        index.verify().unwrap();
        assert_eq!(index.len(), model.len());

        for k in scrambled(211, 53).into_iter().filter(|k| k % 3 == 0) {
            let e = entry(k % 50, &format!("d{}", k));
            assert_eq!(index.remove(&e), Some(Value::Integer(k)));
            model.remove(&e);
        }
        index.verify().unwrap();

        let walked: Vec<_> = index.iter().map(|(e, _)| e.clone()).collect();
        let expected: Vec<_> = model.keys().cloned().collect();
        assert_eq!(walked, expected);
        assert_eq!(
            index.total(),
            Aggregate::Integer(i128::from(model.values().sum::<i64>()))
        );
    }

    #[test]
    fn test_remove_missing_entry_is_noop() {
        let mut index = sum_index();
        index.insert(entry(1, "a"), Value::Integer(1));
        assert_eq!(index.remove(&entry(2, "a")), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_insert_replaces_and_updates_aggregate() {
        let mut index = sum_index();
        index.insert(entry(1, "a"), Value::Integer(5));
        index.insert(entry(2, "b"), Value::Integer(7));
        assert_eq!(
            index.insert(entry(1, "a"), Value::Integer(10)),
            Some(Value::Integer(5))
        );
        assert_eq!(index.total(), Aggregate::Integer(17));
        index.verify().unwrap();
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_writes() {
        let mut index = sum_index();
        for k in 0..20 {
            index.insert(entry(k, "a"), Value::Integer(1));
        }
        let snapshot = index.clone();
        for k in 0..10 {
            index.remove(&entry(k, "a"));
        }
        index.insert(entry(100, "z"), Value::Integer(1));

        assert_eq!(snapshot.len(), 20);
        assert_eq!(snapshot.total(), Aggregate::Integer(20));
        assert!(snapshot.get(&entry(100, "z")).is_none());
        assert_eq!(index.len(), 11);
        snapshot.verify().unwrap();
        index.verify().unwrap();
    }

    #[test]
    fn test_fold_matches_naive_scan() {
        let mut index = SortedIndex::new(Some(Arc::new(CountCombiner)));
        for k in scrambled(101, 7) {
            index.insert(entry(k, "d"), Value::Null);
        }
        for (lo, hi) in [(0, 100), (10, 20), (50, 50), (60, 40), (-5, 3), (99, 200)] {
            let agg = index.fold(
                |e| e.key >= Value::Integer(lo),
                |e| e.key <= Value::Integer(hi),
            );
            let naive = (0..101).filter(|k| *k >= lo && *k <= hi).count() as i64;
            if naive == 0 {
                assert_eq!(agg, Aggregate::Empty);
            } else {
                assert_eq!(agg, Aggregate::Integer(i128::from(naive)), "range {}..={}", lo, hi);
            }
        }
    }

    #[test]
    fn test_seek_in_both_directions() {
        let mut index = SortedIndex::new(None);
        for k in scrambled(31, 5) {
            index.insert(entry(k, "d"), Value::Null);
        }
        let up: Vec<i64> = index
            .seek_ascending(|e| e.key >= Value::Integer(25))
            .filter_map(|(e, _)| e.key.as_i64())
            .collect();
        assert_eq!(up, vec![25, 26, 27, 28, 29, 30]);

        let down: Vec<i64> = index
            .seek_descending(|e| e.key < Value::Integer(4))
            .filter_map(|(e, _)| e.key.as_i64())
            .collect();
        assert_eq!(down, vec![3, 2, 1, 0]);

        let first = index.first_where(|e| e.key > Value::Integer(17));
        assert_eq!(first.map(|(e, _)| e.key.clone()), Some(Value::Integer(18)));
    }

    #[test]
    fn test_from_sorted_is_balanced() {
        let entries: Vec<_> = (0..1000)
            .map(|k| (entry(k, "d"), Value::Integer(1)))
            .collect();
        let index = SortedIndex::from_sorted(entries, Some(Arc::new(CountCombiner)));
        index.verify().unwrap();
        assert_eq!(index.len(), 1000);
        assert!(index.height() <= 11);
        assert_eq!(index.total(), Aggregate::Integer(1000));
    }

    #[test]
    fn test_verify_detects_stale_aggregate() {
        let mut index = SortedIndex::new(Some(Arc::new(CountCombiner)));
        for k in 0..8 {
            index.insert(entry(k, "d"), Value::Null);
        }
        index.poison_root_aggregate(Aggregate::Value(Value::Integer(99)));
        assert!(index.verify().is_err());
    }
}
