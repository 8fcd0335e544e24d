//! Append buffers and their compaction into columnar files
//!
//! Producers append newline-delimited JSON records to a buffer blob with
//! [`AppendWriter`]. A [`Compactor`] periodically isolates the buffer by
//! renaming it, folds its records into a Parquet target whose schema
//! widens as new fields appear, validates what it wrote, and retires the
//! snapshot. Every store operation goes through a [`ResiliencePolicy`]
//! that retries transient failures with bounded exponential backoff.

pub mod append;
pub mod columnar;
pub mod config;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod isolation;
pub mod outcome;
pub mod resilience;
pub mod rows;
pub mod schema;

pub use append::{AppendReceipt, AppendWriter};
pub use config::{
    BufpondConfig, CompactionConfig, CompactionOptions, ResilienceConfig, RetryProfile,
    StoreConfig, WriteStrategy,
};
pub use engine::{
    CompactionJob, CompactionOutcome, CompactionReport, CompactionRequest, CompactionState,
    Compactor,
};
pub use error::{CompactorError, Result};
pub use integrity::IntegrityValidator;
pub use isolation::{IsolatedBuffer, isolate};
pub use outcome::{BatchReport, Outcome};
pub use resilience::{ResiliencePolicy, RetryClass, RetryContext, RetryEvent, RetryObserver};

pub use tokio_util::sync::CancellationToken;
