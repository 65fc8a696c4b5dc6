pub mod index;
pub mod persistence;
pub mod store;
pub mod tree;

pub use index::{DiffStats, ViewIndex};
pub use persistence::{CheckpointHeader, CheckpointStore, ViewCheckpoint};
pub use store::{DocumentStore, MemoryDocumentStore};
pub use tree::{EntryKey, Entries, SortedIndex};
