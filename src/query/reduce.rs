//! Grouped aggregation over a view snapshot.
//!
//! Every group is answered by one lower-bound search and one range fold on
//! the cached aggregates, so a query costs O(groups * log n).

use super::range::{KeyBound, KeyRange, Order};
use crate::core::{IndexError, Result, Value};
use crate::reduce::Aggregate;
use crate::storage::{EntryKey, SortedIndex, ViewIndex};
use crate::view::Freshness;
use serde::{Deserialize, Serialize};

/// How entries are grouped before reducing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Grouping {
    /// One aggregate for the whole range.
    #[default]
    All,
    /// One aggregate per distinct key.
    Exact,
    /// One aggregate per distinct leading `n` elements of array keys.
    /// Non-array keys form their own groups.
    Level(usize),
}

impl Grouping {
    fn normalized(self) -> Self {
        match self {
            Grouping::Level(0) => Grouping::All,
            other => other,
        }
    }

    /// Group key of an emitted key.
    pub fn group_key(self, key: &Value) -> Value {
        match self.normalized() {
            Grouping::All => Value::Null,
            Grouping::Exact => key.clone(),
            Grouping::Level(n) => match key {
                Value::Array(items) => Value::Array(items[..n.min(items.len())].to_vec()),
                other => other.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReduceQuery {
    /// Range in ascending terms.
    pub range: KeyRange,
    pub grouping: Grouping,
    pub order: Order,
    pub limit: Option<usize>,
    pub freshness: Freshness,
}

impl ReduceQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn key(key: impl Into<Value>) -> Self {
        let key = key.into();
        Self::with_bounds(KeyBound::Included(key.clone()), KeyBound::Included(key))
    }

    pub fn prefix(parts: Vec<Value>) -> Self {
        Self::with_bounds(KeyBound::Prefix(parts.clone()), KeyBound::Prefix(parts))
    }

    pub fn between(lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        Self::with_bounds(KeyBound::Included(lower.into()), KeyBound::Included(upper.into()))
    }

    pub fn with_bounds(lower: KeyBound, upper: KeyBound) -> Self {
        Self {
            range: KeyRange::new(lower, upper),
            ..Self::default()
        }
    }

    pub fn grouped(mut self, grouping: Grouping) -> Self {
        self.grouping = grouping;
        self
    }

    /// Groups by the first `n` key elements (`group_prefix_len`).
    pub fn group_level(self, n: usize) -> Self {
        self.grouped(Grouping::Level(n))
    }

    pub fn descending(mut self) -> Self {
        self.order = Order::Descending;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReduceRow {
    /// Group key; `null` for `Grouping::All`.
    pub key: Value,
    /// Aggregate of the group; `null` when no entry contributed a value.
    pub value: Value,
}

/// Walks the distinct groups of `range` in ascending order.
struct GroupWalk<'a> {
    tree: &'a SortedIndex,
    range: &'a KeyRange,
    grouping: Grouping,
    last: Option<Value>,
}

impl<'a> GroupWalk<'a> {
    fn new(tree: &'a SortedIndex, range: &'a KeyRange, grouping: Grouping) -> Self {
        Self {
            tree,
            range,
            grouping,
            last: None,
        }
    }

    fn in_group_or_later(&self, e: &EntryKey, group: &Value) -> bool {
        self.range.lower.admits_from_below(&e.key) && self.grouping.group_key(&e.key) >= *group
    }

    fn in_group_or_earlier(&self, e: &EntryKey, group: &Value) -> bool {
        self.range.upper.admits_from_above(&e.key) && self.grouping.group_key(&e.key) <= *group
    }

    fn fold_group(&self, group: &Value) -> Aggregate {
        self.tree.fold(
            |e| self.in_group_or_later(e, group),
            |e| self.in_group_or_earlier(e, group),
        )
    }
}

impl Iterator for GroupWalk<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let tree = self.tree;
        let grouping = self.grouping;
        let range = self.range;
        let last = self.last.as_ref();
        let (entry, _) = tree.first_where(|e| {
            range.lower.admits_from_below(&e.key)
                && last.is_none_or(|g| grouping.group_key(&e.key) > *g)
        })?;
        if !range.upper.admits_from_above(&entry.key) {
            return None;
        }
        let group = grouping.group_key(&entry.key);
        self.last = Some(group.clone());
        Some(group)
    }
}

fn has_entries(tree: &SortedIndex, range: &KeyRange) -> bool {
    tree.first_where(|e| range.lower.admits_from_below(&e.key))
        .is_some_and(|(e, _)| range.upper.admits_from_above(&e.key))
}

/// Runs a grouped reduce against one snapshot.
pub fn execute_reduce(view: &str, index: &ViewIndex, query: &ReduceQuery) -> Result<Vec<ReduceRow>> {
    let tree = index.tree();
    let Some(combiner) = tree.combiner() else {
        return Err(IndexError::ReduceNotDefined(view.to_string()));
    };
    query.range.validate()?;

    let grouping = query.grouping.normalized();
    if grouping == Grouping::All {
        if !has_entries(tree, &query.range) {
            return Ok(Vec::new());
        }
        let agg = tree.fold(
            |e| query.range.lower.admits_from_below(&e.key),
            |e| query.range.upper.admits_from_above(&e.key),
        );
        let value = agg.into_result(view, combiner.as_ref())?.unwrap_or_default();
        let rows = vec![ReduceRow {
            key: Value::Null,
            value,
        }];
        return Ok(rows.into_iter().take(query.limit.unwrap_or(usize::MAX)).collect());
    }

    // Descending output needs every group before the limit applies.
    let ascending_limit = match query.order {
        Order::Ascending => query.limit.unwrap_or(usize::MAX),
        Order::Descending => usize::MAX,
    };

    let mut walk = GroupWalk::new(tree, &query.range, grouping);
    let mut groups = Vec::new();
    while groups.len() < ascending_limit {
        let Some(group) = walk.next() else { break };
        groups.push(group);
    }

    let mut rows = Vec::with_capacity(groups.len());
    for group in groups {
        let value = walk
            .fold_group(&group)
            .into_result(view, combiner.as_ref())?
            .unwrap_or_default();
        rows.push(ReduceRow { key: group, value });
    }

    if query.order == Order::Descending {
        rows.reverse();
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
    }
    Ok(rows)
}

/// Number of distinct group keys in `range`.
///
/// Needs no reduce function; deduplicating by document is grouping on a
/// key that ends with the document identity.
pub fn count_distinct_groups(index: &ViewIndex, range: &KeyRange, grouping: Grouping) -> Result<usize> {
    range.validate()?;
    let tree = index.tree();
    match grouping.normalized() {
        Grouping::All => Ok(usize::from(has_entries(tree, range))),
        grouping => Ok(GroupWalk::new(tree, range, grouping).count()),
    }
}
