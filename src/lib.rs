// ============================================================================
// docindex Library
// ============================================================================
//
// Incremental secondary indexes ("views") over an external document store.
// A view projects every document into sorted (key, value) entries and can
// carry a reduce function whose partial aggregates are cached inside the
// index tree. Views follow the store's change feed and are queried through
// immutable snapshots.
//
// ============================================================================

pub mod config;
pub mod core;
pub mod facade;
pub mod projection;
pub mod query;
pub mod reduce;
pub mod storage;
pub mod view;

pub use config::{CheckpointPolicy, EngineConfig, RetryPolicy, WorkerPolicy};
pub use core::{
    ChangeEvent, ChangeSeq, DocId, Document, IndexError, Result, Revision, Value,
};
pub use facade::IndexEngine;
pub use projection::{
    DoctypeRouter, Emission, EmissionBuffer, Projection, ProjectionFailure, ProjectionResult,
};
pub use query::{
    Grouping, KeyBound, KeyRange, Order, RangePage, RangeQuery, RangeRow, ReduceQuery, ReduceRow,
};
pub use reduce::{Aggregate, Combiner, CombinerFn, OverflowPolicy, ReduceSpec};
pub use storage::{DocumentStore, EntryKey, MemoryDocumentStore, ViewIndex};
pub use view::{
    CatchUpReport, FailedChange, Freshness, IndexWorker, RebuildReason, ViewDefinition, ViewState,
    ViewStatus, spawn_index_worker,
};
