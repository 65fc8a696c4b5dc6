use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("View '{0}' not found")]
    ViewNotFound(String),

    #[error("View '{0}' already exists")]
    ViewExists(String),

    #[error("Invalid view id '{0}'")]
    InvalidViewId(String),

    #[error("Projection failed for view '{view}' on document '{doc_id}' after {attempts} attempt(s): {message}")]
    Projection {
        view: String,
        doc_id: String,
        attempts: u32,
        message: String,
    },

    #[error("View '{view}' is stale: watermark {watermark} did not reach {target} within {waited_ms}ms")]
    StalenessTimeout {
        view: String,
        watermark: u64,
        target: u64,
        waited_ms: u64,
    },

    #[error("Index for view '{view}' is corrupt: {detail}")]
    CorruptIndex { view: String, detail: String },

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("View '{0}' has no reduce function")]
    ReduceNotDefined(String),

    #[error("Unknown combiner '{0}'")]
    UnknownCombiner(String),

    #[error("Numeric overflow while reducing view '{0}'")]
    NumericOverflow(String),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Document store error: {0}")]
    DocumentStore(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl IndexError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StalenessTimeout { .. } | Self::CorruptIndex { .. } | Self::DocumentStore(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

impl<T> From<std::sync::PoisonError<T>> for IndexError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
