//! Configuration for buffers, retries and compaction
//!
//! Settings resolve in three layers: a per-call [`CompactionOptions`]
//! override, then the shared [`BufpondConfig`] (usually loaded from YAML),
//! then the built-in defaults below.
//!
//! ```yaml
//! stores:
//!   events:
//!     url: file:///var/lib/bufpond
//! resilience:
//!   mutation:
//!     max_attempts: 5
//!     min_delay_ms: 100
//!     max_delay_ms: 10000
//! compaction:
//!   write_strategy: append_row_group
//!   preserve_failed: true
//! ```

use crate::columnar::MIN_PARQUET_SIZE;
use crate::error::{CompactorError, Result};
use crate::resilience::RetryClass;
use blobfs::StoreRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Bounded exponential backoff for one class of operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryProfile {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub min_delay_ms: u64,
    /// No single backoff delay exceeds this, jitter included
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryProfile {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

impl RetryProfile {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Cheaper profile for idempotent metadata reads: fewer attempts,
    /// half the delay bounds.
    pub fn for_metadata(&self) -> Self {
        Self {
            max_attempts: self
                .max_attempts
                .saturating_sub(2)
                .max(2)
                .min(self.max_attempts),
            min_delay_ms: self.min_delay_ms / 2,
            max_delay_ms: self.max_delay_ms / 2,
            jitter: self.jitter,
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CompactorError::Config(format!(
                "{name}.max_attempts must be at least 1"
            )));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(CompactorError::Config(format!(
                "{name}.min_delay_ms ({}) exceeds max_delay_ms ({})",
                self.min_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Appends, renames, uploads, deletes and data reads
    pub mutation: RetryProfile,
    /// Existence and length checks; derived from `mutation` when omitted
    pub metadata: Option<RetryProfile>,
}

impl ResilienceConfig {
    pub fn profile(&self, class: RetryClass) -> RetryProfile {
        match class {
            RetryClass::Mutation => self.mutation.clone(),
            RetryClass::Metadata => self
                .metadata
                .clone()
                .unwrap_or_else(|| self.mutation.for_metadata()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.mutation.validate("resilience.mutation")?;
        if let Some(metadata) = &self.metadata {
            metadata.validate("resilience.metadata")?;
        }
        Ok(())
    }
}

/// How the columnar object is rewritten on each pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// All rows concatenated into fresh row groups
    #[default]
    Rewrite,
    /// Prior row groups kept as they were read, new rows in a new row group
    AppendRowGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Objects shorter than this are treated as corrupt and deleted
    pub min_valid_size: u64,
    /// Keep a failed pass's snapshot under `<buffer>.failed.<ts>` instead of deleting it
    pub preserve_failed: bool,
    /// Delete the isolated snapshot after a successful pass
    pub delete_isolated_on_success: bool,
    pub write_strategy: WriteStrategy,
    /// How often an append may find its buffer renamed away before giving up
    pub max_recreate_attempts: u32,
    pub max_row_group_size: usize,
    /// Passes run at once by `compact_many`
    pub max_concurrent_jobs: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            min_valid_size: MIN_PARQUET_SIZE,
            preserve_failed: true,
            delete_isolated_on_success: true,
            write_strategy: WriteStrategy::Rewrite,
            max_recreate_attempts: 2,
            max_row_group_size: 1024 * 1024,
            max_concurrent_jobs: 8,
        }
    }
}

impl CompactionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_row_group_size == 0 {
            return Err(CompactorError::Config(
                "compaction.max_row_group_size must be positive".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(CompactorError::Config(
                "compaction.max_concurrent_jobs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `memory://` or `file:///absolute/path`
    pub url: String,
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufpondConfig {
    pub stores: BTreeMap<String, StoreConfig>,
    pub resilience: ResilienceConfig,
    pub compaction: CompactionConfig,
}

impl BufpondConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.resilience.validate()?;
        self.compaction.validate()
    }

    /// Open every configured store
    pub fn open_stores(&self) -> Result<StoreRegistry> {
        Ok(StoreRegistry::from_urls(
            self.stores.iter().map(|(name, store)| (name.clone(), &store.url)),
        )?)
    }
}

/// Per-call overrides for a compaction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionOptions {
    pub min_valid_size: Option<u64>,
    pub preserve_failed: Option<bool>,
    pub delete_isolated_on_success: Option<bool>,
    pub write_strategy: Option<WriteStrategy>,
    /// Wall-clock budget for the whole pass, not per attempt
    pub deadline: Option<Duration>,
}

impl CompactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_write_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.write_strategy = Some(strategy);
        self
    }

    pub fn with_preserve_failed(mut self, preserve: bool) -> Self {
        self.preserve_failed = Some(preserve);
        self
    }

    pub fn with_min_valid_size(mut self, size: u64) -> Self {
        self.min_valid_size = Some(size);
        self
    }

    /// Overlay these overrides on the shared settings
    pub fn resolve(&self, shared: &CompactionConfig) -> CompactionConfig {
        CompactionConfig {
            min_valid_size: self.min_valid_size.unwrap_or(shared.min_valid_size),
            preserve_failed: self.preserve_failed.unwrap_or(shared.preserve_failed),
            delete_isolated_on_success: self
                .delete_isolated_on_success
                .unwrap_or(shared.delete_isolated_on_success),
            write_strategy: self.write_strategy.unwrap_or(shared.write_strategy),
            ..shared.clone()
        }
    }
}
