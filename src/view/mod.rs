pub mod catalog;
pub mod maintainer;
pub mod staleness;
pub mod worker;

pub use catalog::{ViewCatalog, ViewDefinition, ViewHandle, validate_view_id};
pub use maintainer::{CatchUpReport, FailedChange, IndexMaintainer};
pub use staleness::{
    Freshness, RebuildReason, StalenessController, ViewState, ViewStatus, wait_for_watermark,
};
pub use worker::{IndexWorker, spawn_index_worker};
