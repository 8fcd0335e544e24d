// Error types for buffer and compaction operations
use blobfs::{BlobError, ErrorClass};

pub type Result<T> = std::result::Result<T, CompactorError>;

#[derive(Debug, thiserror::Error)]
pub enum CompactorError {
    #[error("Store error: {0}")]
    Store(#[from] BlobError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error(
        "Corrupt object {path}: {length} bytes is below the minimum valid size of {min_valid_size}"
    )]
    Corruption {
        path: String,
        length: u64,
        min_valid_size: u64,
    },

    #[error("Buffer {path} disappeared {attempts} times during append: {source}")]
    RecreationExhausted {
        path: String,
        attempts: u32,
        #[source]
        source: BlobError,
    },

    #[error("Column '{field}' cannot be stored as {existing}: {message}")]
    SchemaConflict {
        field: String,
        existing: String,
        message: String,
    },

    #[error("Invalid record #{index}: {reason}")]
    InvalidRecord { index: usize, reason: String },

    #[error("A compaction into {target} is already in flight")]
    InFlight { target: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline of {millis} ms exceeded")]
    DeadlineExceeded { millis: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompactorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CompactorError::Store(e) => e.class(),
            CompactorError::Corruption { .. } => ErrorClass::Corruption,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// The object vanished underneath us (renamed by a compaction pass)
    pub fn is_not_found(&self) -> bool {
        matches!(self, CompactorError::Store(e) if e.is_not_found())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            CompactorError::Cancelled | CompactorError::DeadlineExceeded { .. }
        )
    }
}
