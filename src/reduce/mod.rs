// ============================================================================
// Reduce specifications and combiners
// ============================================================================
//
// A combiner turns index entries into aggregates. The sorted index caches
// one aggregate per tree node, so combiners must be associative; the
// built-in ones are also commutative. Custom combiners are trusted to hold
// that invariant.
//
// ============================================================================

use crate::core::{IndexError, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Reduce function attached to a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReduceSpec {
    #[default]
    None,
    Count,
    /// Sum the emitted value, or the named field of an object value.
    Sum { field: Option<String> },
    /// A combiner registered by name on the engine.
    Named(String),
}

impl ReduceSpec {
    pub fn sum() -> Self {
        Self::Sum { field: None }
    }

    pub fn sum_field(field: impl Into<String>) -> Self {
        Self::Sum {
            field: Some(field.into()),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Stable text form, stored in checkpoints to detect a changed definition.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::None => "none".to_string(),
            Self::Count => "count".to_string(),
            Self::Sum { field: None } => "sum".to_string(),
            Self::Sum { field: Some(f) } => format!("sum({})", f),
            Self::Named(name) => format!("named({})", name),
        }
    }
}

/// What happens when an integer sum leaves the `i64` range. Only the
/// total a query reads is checked; partial sums are exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OverflowPolicy {
    /// The aggregate becomes unrepresentable and queries fail with
    /// `NumericOverflow`.
    #[default]
    Checked,
    /// Clamp the total at `i64::MIN` / `i64::MAX`.
    Saturating,
}

/// Associative combine over index entries.
pub trait Combiner: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Contribution of one entry; `None` skips it.
    fn lift(&self, key: &Value, value: &Value) -> Option<Value>;

    /// Combines two partial aggregates; `None` means the result cannot be
    /// represented.
    fn combine(&self, left: &Value, right: &Value) -> Option<Value>;

    /// Integer contributions are added exactly as `Aggregate::Integer` and
    /// only narrowed by `finish_integer` when a query reads them.
    fn adds_integers(&self) -> bool {
        false
    }

    /// Narrows an exact integer total; `None` when it is not representable.
    fn finish_integer(&self, total: i128) -> Option<Value> {
        i64::try_from(total).ok().map(Value::Integer)
    }
}

/// Cached aggregate of a contiguous run of entries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Aggregate {
    /// No entry contributed.
    #[default]
    Empty,
    /// Exact total of integer contributions. Partial totals never clamp or
    /// fail, so the result does not depend on tree shape.
    Integer(i128),
    Value(Value),
    /// Absorbing: some combine step was not representable.
    Overflow,
}

impl Aggregate {
    pub fn leaf(combiner: &dyn Combiner, key: &Value, value: &Value) -> Self {
        match combiner.lift(key, value) {
            Some(Value::Integer(n)) if combiner.adds_integers() => {
                Aggregate::Integer(i128::from(n))
            }
            Some(v) => Aggregate::Value(v),
            None => Aggregate::Empty,
        }
    }

    pub fn merge(&self, other: &Aggregate, combiner: &dyn Combiner) -> Aggregate {
        match (self, other) {
            (Aggregate::Overflow, _) | (_, Aggregate::Overflow) => Aggregate::Overflow,
            (Aggregate::Empty, x) | (x, Aggregate::Empty) => x.clone(),
            (Aggregate::Integer(a), Aggregate::Integer(b)) => a
                .checked_add(*b)
                .map(Aggregate::Integer)
                .unwrap_or(Aggregate::Overflow),
            (left, right) => match (left.partial_value(), right.partial_value()) {
                (Some(a), Some(b)) => combiner
                    .combine(&a, &b)
                    .map(Aggregate::Value)
                    .unwrap_or(Aggregate::Overflow),
                _ => Aggregate::Overflow,
            },
        }
    }

    /// Value form of a partial, for combining with a non-integer partial.
    /// Integer totals outside `i64` continue as floats.
    fn partial_value(&self) -> Option<Value> {
        match self {
            Aggregate::Integer(n) => Some(
                i64::try_from(*n)
                    .map(Value::Integer)
                    .unwrap_or(Value::Float(*n as f64)),
            ),
            Aggregate::Value(v) => Some(v.clone()),
            Aggregate::Empty | Aggregate::Overflow => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Aggregate::Empty)
    }

    /// Final value of a query result; `Ok(None)` for an empty aggregate.
    /// The combiner's overflow policy applies here, once.
    pub fn into_result(self, view: &str, combiner: &dyn Combiner) -> Result<Option<Value>> {
        match self {
            Aggregate::Empty => Ok(None),
            Aggregate::Integer(total) => combiner
                .finish_integer(total)
                .map(Some)
                .ok_or_else(|| IndexError::NumericOverflow(view.to_string())),
            Aggregate::Value(v) => Ok(Some(v)),
            Aggregate::Overflow => Err(IndexError::NumericOverflow(view.to_string())),
        }
    }
}

#[derive(Debug)]
pub struct CountCombiner;

impl Combiner for CountCombiner {
    fn name(&self) -> &str {
        "count"
    }

    fn lift(&self, _key: &Value, _value: &Value) -> Option<Value> {
        Some(Value::Integer(1))
    }

    fn combine(&self, left: &Value, right: &Value) -> Option<Value> {
        match (left, right) {
            (Value::Integer(a), Value::Integer(b)) => a.checked_add(*b).map(Value::Integer),
            _ => None,
        }
    }

    fn adds_integers(&self) -> bool {
        true
    }
}

#[derive(Debug)]
pub struct SumCombiner {
    field: Option<String>,
    overflow: OverflowPolicy,
}

impl SumCombiner {
    pub fn new(field: Option<String>, overflow: OverflowPolicy) -> Self {
        Self { field, overflow }
    }
}

impl Combiner for SumCombiner {
    fn name(&self) -> &str {
        "sum"
    }

    fn lift(&self, _key: &Value, value: &Value) -> Option<Value> {
        let target = match &self.field {
            Some(field) => value.get(field)?,
            None => value,
        };
        target.is_numeric().then(|| target.clone())
    }

    fn combine(&self, left: &Value, right: &Value) -> Option<Value> {
        match (left, right) {
            (Value::Integer(a), Value::Integer(b)) => {
                self.finish_integer(i128::from(*a) + i128::from(*b))
            }
            _ => Some(Value::Float(left.as_f64()? + right.as_f64()?)),
        }
    }

    fn adds_integers(&self) -> bool {
        true
    }

    fn finish_integer(&self, total: i128) -> Option<Value> {
        let narrowed = match self.overflow {
            OverflowPolicy::Checked => i64::try_from(total).ok()?,
            OverflowPolicy::Saturating => {
                i64::try_from(total).unwrap_or(if total < 0 { i64::MIN } else { i64::MAX })
            }
        };
        Some(Value::Integer(narrowed))
    }
}

/// Smallest (or largest) non-null value by view collation.
#[derive(Debug)]
pub struct ExtremumCombiner {
    largest: bool,
}

impl Combiner for ExtremumCombiner {
    fn name(&self) -> &str {
        if self.largest { "max" } else { "min" }
    }

    fn lift(&self, _key: &Value, value: &Value) -> Option<Value> {
        (!value.is_null()).then(|| value.clone())
    }

    fn combine(&self, left: &Value, right: &Value) -> Option<Value> {
        let pick_right = if self.largest { right > left } else { right < left };
        Some(if pick_right { right.clone() } else { left.clone() })
    }
}

type LiftFn = dyn Fn(&Value, &Value) -> Option<Value> + Send + Sync;
type CombineFn = dyn Fn(&Value, &Value) -> Option<Value> + Send + Sync;

/// Combiner built from closures.
pub struct CombinerFn {
    name: String,
    lift: Box<LiftFn>,
    combine: Box<CombineFn>,
}

impl CombinerFn {
    pub fn new<L, C>(name: impl Into<String>, lift: L, combine: C) -> Self
    where
        L: Fn(&Value, &Value) -> Option<Value> + Send + Sync + 'static,
        C: Fn(&Value, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            lift: Box::new(lift),
            combine: Box::new(combine),
        }
    }
}

impl fmt::Debug for CombinerFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinerFn").field("name", &self.name).finish()
    }
}

impl Combiner for CombinerFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn lift(&self, key: &Value, value: &Value) -> Option<Value> {
        (self.lift)(key, value)
    }

    fn combine(&self, left: &Value, right: &Value) -> Option<Value> {
        (self.combine)(left, right)
    }
}

/// Named combiners available to `ReduceSpec::Named`.
#[derive(Debug, Clone)]
pub struct CombinerRegistry {
    named: HashMap<String, Arc<dyn Combiner>>,
}

impl CombinerRegistry {
    pub fn new() -> Self {
        let mut named: HashMap<String, Arc<dyn Combiner>> = HashMap::new();
        named.insert("min".to_string(), Arc::new(ExtremumCombiner { largest: false }));
        named.insert("max".to_string(), Arc::new(ExtremumCombiner { largest: true }));
        Self { named }
    }

    pub fn register(&mut self, name: impl Into<String>, combiner: Arc<dyn Combiner>) {
        self.named.insert(name.into(), combiner);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.named.contains_key(name)
    }

    /// Resolves a spec into the combiner the index will cache.
    pub fn resolve(
        &self,
        spec: &ReduceSpec,
        overflow: OverflowPolicy,
    ) -> Result<Option<Arc<dyn Combiner>>> {
        match spec {
            ReduceSpec::None => Ok(None),
            ReduceSpec::Count => Ok(Some(Arc::new(CountCombiner))),
            ReduceSpec::Sum { field } => {
                Ok(Some(Arc::new(SumCombiner::new(field.clone(), overflow))))
            }
            ReduceSpec::Named(name) => self
                .named
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| IndexError::UnknownCombiner(name.clone())),
        }
    }
}

impl Default for CombinerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
