//! Integrity checks around non-atomic writes
//!
//! A fresh object is written as create, append, commit. A failure between
//! those steps leaves an object that exists but is too short to be valid.
//! The validator removes such objects both after a write that claims
//! success and after one that failed, so nothing later mistakes them for
//! a real file.

use crate::error::{CompactorError, Result};
use crate::resilience::{ResiliencePolicy, RetryClass};
use blobfs::BlobStore;
use diagnostics::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct IntegrityValidator {
    store: Arc<dyn BlobStore>,
    policy: ResiliencePolicy,
}

impl IntegrityValidator {
    pub fn new(store: Arc<dyn BlobStore>, policy: ResiliencePolicy) -> Self {
        Self { store, policy }
    }

    /// Check the outcome of a write to `path`.
    ///
    /// A successful write is validated and its committed length returned.
    /// A failed write has its partial artifact removed and the original
    /// error returned unchanged.
    pub async fn validate_or_cleanup<T>(
        &self,
        path: &str,
        min_valid_size: u64,
        write_result: Result<T>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        match write_result {
            Ok(_) => self.validate_after_write(path, min_valid_size, cancel).await,
            Err(original) => Err(self
                .cleanup_after_failure(path, min_valid_size, original)
                .await),
        }
    }

    /// Confirm `path` holds at least `min_valid_size` bytes, deleting it
    /// and reporting `Corruption` otherwise.
    pub async fn validate_after_write(
        &self,
        path: &str,
        min_valid_size: u64,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let store = &self.store;
        let length = self
            .policy
            .execute(
                RetryClass::Metadata,
                &format!("length of {path}"),
                cancel,
                |_| async move { Ok(store.get_length(path).await?) },
            )
            .await?;

        if length >= min_valid_size {
            return Ok(length);
        }

        log_error!(
            "Deleting corrupt object {path}: {length} bytes, need at least {min_valid_size}",
            path: path,
            length: length,
            min_valid_size: min_valid_size
        );
        if let Err(e) = self.delete(path).await {
            log_warn!(
                "Could not delete corrupt object {path}: {error}",
                path: path,
                error: e.to_string()
            );
        }
        Err(CompactorError::Corruption {
            path: path.to_string(),
            length,
            min_valid_size,
        })
    }

    /// Remove a short leftover of a failed write to `path`, then hand back
    /// `original`. Objects at or above `min_valid_size` may be a prior
    /// version and are left alone. Problems here are logged, never returned.
    pub async fn cleanup_after_failure(
        &self,
        path: &str,
        min_valid_size: u64,
        original: CompactorError,
    ) -> CompactorError {
        match self.remove_if_short(path, min_valid_size).await {
            Ok(true) => {
                log_error!(
                    "Deleted partial object {path} left by a failed write: {error}",
                    path: path,
                    error: original.to_string()
                );
            }
            Ok(false) => {}
            Err(e) => {
                log_warn!(
                    "Cleanup of {path} after a failed write did not complete: {error}",
                    path: path,
                    error: e.to_string()
                );
            }
        }
        original
    }

    async fn remove_if_short(&self, path: &str, min_valid_size: u64) -> Result<bool> {
        let store = &self.store;
        // Cleanup runs even when the pass itself was cancelled
        let uncancellable = CancellationToken::new();
        let length = self
            .policy
            .execute(
                RetryClass::Metadata,
                &format!("length of {path}"),
                &uncancellable,
                |_| async move {
                    match store.get_length(path).await {
                        Ok(length) => Ok(Some(length)),
                        Err(e) if e.is_not_found() => Ok(None),
                        Err(e) => Err(e.into()),
                    }
                },
            )
            .await?;

        match length {
            Some(length) if length < min_valid_size => {
                self.delete(path).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let store = &self.store;
        self.policy
            .execute(
                RetryClass::Mutation,
                &format!("delete {path}"),
                &CancellationToken::new(),
                |_| async move { Ok(store.delete(path).await?) },
            )
            .await
    }
}
