pub mod error;
pub mod types;
pub mod value;

pub use error::{IndexError, Result};
pub use types::{ChangeEvent, ChangeSeq, DocId, Document, Revision};
pub use value::{Value, collate_slices};
