//! Append buffer writer
//!
//! Records accumulate in a buffer blob through offset-addressed appends.
//! Each attempt re-reads the committed length, stages the bytes at that
//! offset and commits past them, so a transient retry never reuses a
//! stale offset.
//!
//! A compaction pass may rename the buffer away at any moment. The next
//! append or commit against the old name then fails with `NotFound`, and
//! the whole sequence is restarted against a freshly created buffer, a
//! bounded number of times.
//!
//! Two writers appending to the same buffer concurrently are not
//! serialized here. Callers keep one writer per buffer path.

use crate::error::{CompactorError, Result};
use crate::resilience::{ResiliencePolicy, RetryClass};
use crate::rows;
use blobfs::BlobStore;
use bytes::Bytes;
use diagnostics::*;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default bound on buffer recreations per append call
pub const DEFAULT_MAX_RECREATE_ATTEMPTS: u32 = 2;

/// Where an append landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReceipt {
    /// Committed length of the buffer before this append
    pub offset: u64,
    pub length: u64,
    /// How often the buffer had to be recreated
    pub recreations: u32,
}

#[derive(Debug, Clone)]
pub struct AppendWriter {
    store: Arc<dyn BlobStore>,
    policy: ResiliencePolicy,
    max_recreate_attempts: u32,
}

impl AppendWriter {
    pub fn new(store: Arc<dyn BlobStore>, policy: ResiliencePolicy) -> Self {
        Self {
            store,
            policy,
            max_recreate_attempts: DEFAULT_MAX_RECREATE_ATTEMPTS,
        }
    }

    pub fn with_max_recreate_attempts(mut self, attempts: u32) -> Self {
        self.max_recreate_attempts = attempts;
        self
    }

    /// Validate, frame and append already-serialized records
    pub async fn append_records<I, R>(
        &self,
        buffer: &str,
        records: I,
        cancel: &CancellationToken,
    ) -> Result<AppendReceipt>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[u8]>,
    {
        let data = rows::frame(records)?;
        self.append(buffer, data, cancel).await
    }

    /// Serialize `records` as JSON lines and append them
    pub async fn append_json<T: Serialize>(
        &self,
        buffer: &str,
        records: &[T],
        cancel: &CancellationToken,
    ) -> Result<AppendReceipt> {
        let data = rows::encode_json(records)?;
        self.append(buffer, data, cancel).await
    }

    /// Append framed bytes to `buffer`, creating it if needed.
    ///
    /// Empty input touches nothing and reports offset 0.
    pub async fn append(
        &self,
        buffer: &str,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<AppendReceipt> {
        if data.is_empty() {
            return Ok(AppendReceipt {
                offset: 0,
                length: 0,
                recreations: 0,
            });
        }

        let mut recreations = 0u32;
        loop {
            match self.append_once(buffer, &data, cancel).await {
                Ok(offset) => {
                    log_debug!(
                        "Appended {length} bytes to {buffer} at offset {offset}",
                        buffer: buffer,
                        offset: offset,
                        length: data.len()
                    );
                    return Ok(AppendReceipt {
                        offset,
                        length: data.len() as u64,
                        recreations,
                    });
                }
                Err(CompactorError::Store(source)) if source.is_not_found() => {
                    if recreations >= self.max_recreate_attempts {
                        log_error!(
                            "Buffer {buffer} kept disappearing, giving up after {recreations} recreations",
                            buffer: buffer,
                            recreations: recreations
                        );
                        return Err(CompactorError::RecreationExhausted {
                            path: buffer.to_string(),
                            attempts: recreations,
                            source,
                        });
                    }
                    recreations += 1;
                    log_warn!(
                        "Buffer {buffer} was renamed away mid-append, recreating ({recreations} of {max})",
                        buffer: buffer,
                        recreations: recreations,
                        max: self.max_recreate_attempts
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One read-length, append, commit sequence under the mutation policy
    async fn append_once(
        &self,
        buffer: &str,
        data: &Bytes,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let store = &self.store;
        let label = format!("append to {buffer}");
        self.policy
            .execute(RetryClass::Mutation, &label, cancel, |ctx| async move {
                if ctx.is_retry() {
                    log_debug!("Re-reading length of {buffer} before retrying", buffer: buffer);
                }
                let offset = current_length_or_create(store.as_ref(), buffer).await?;
                store.append(buffer, data.clone(), offset).await?;
                store.commit(buffer, offset + data.len() as u64).await?;
                Ok(offset)
            })
            .await
    }
}

/// Committed length of `buffer`, creating it empty when absent
async fn current_length_or_create(store: &dyn BlobStore, buffer: &str) -> Result<u64> {
    match store.get_length(buffer).await {
        Ok(length) => Ok(length),
        Err(e) if e.is_not_found() => match store.create_empty(buffer).await {
            Ok(()) => Ok(0),
            // Lost a creation race or a lost response; the buffer is there now
            Err(e) if e.is_already_exists() => Ok(store.get_length(buffer).await?),
            Err(e) => Err(e.into()),
        },
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResilienceConfig, RetryProfile};
    use blobfs::MemoryBlobStore;
    use blobfs::testing::{Fault, FaultError, FaultyBlobStore, StoreOp};

    fn fast_policy() -> ResiliencePolicy {
        ResiliencePolicy::new(ResilienceConfig {
            mutation: RetryProfile {
                max_attempts: 4,
                min_delay_ms: 1,
                max_delay_ms: 2,
                jitter: false,
            },
            metadata: None,
        })
    }

    #[tokio::test]
    async fn test_first_append_creates_buffer() {
        let memory = MemoryBlobStore::new();
        let writer = AppendWriter::new(Arc::new(memory.clone()), fast_policy());
        let cancel = CancellationToken::new();

        let first = writer
            .append_records("buf", ["{\"id\":1}"], &cancel)
            .await
            .unwrap();
        let second = writer
            .append_records("buf", ["{\"id\":2}", "{\"id\":3}"], &cancel)
            .await
            .unwrap();

        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, first.length);
        assert_eq!(
            memory.read_all("buf").await.unwrap(),
            Bytes::from_static(b"{\"id\":1}\n{\"id\":2}\n{\"id\":3}\n")
        );
    }

    #[tokio::test]
    async fn test_empty_append_is_a_noop() {
        let memory = MemoryBlobStore::new();
        let writer = AppendWriter::new(Arc::new(memory.clone()), fast_policy());
        let receipt = writer
            .append("buf", Bytes::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(receipt.length, 0);
        assert!(!memory.exists("buf").await.unwrap());
    }

    #[tokio::test]
    async fn test_transient_commit_failure_rereads_length() {
        let memory = MemoryBlobStore::new();
        let faulty = FaultyBlobStore::new(memory.clone());
        faulty
            .fail_next(StoreOp::Commit, Fault::Fail(FaultError::Throttled))
            .await;
        let faulty = Arc::new(faulty);
        let writer = AppendWriter::new(faulty.clone(), fast_policy());

        writer
            .append_records("buf", ["{\"a\":1}"], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(faulty.calls(StoreOp::GetLength).await, 2);
        assert_eq!(faulty.calls(StoreOp::Commit).await, 2);
        assert_eq!(memory.get_length("buf").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_rename_during_append_recreates_buffer() {
        let memory = MemoryBlobStore::new();
        memory.insert("buf", b"{\"old\":1}\n".to_vec()).await;
        let faulty = FaultyBlobStore::new(memory.clone());
        faulty
            .fail_next(
                StoreOp::Commit,
                Fault::RenameAway {
                    to: "buf.compacting.1".to_string(),
                },
            )
            .await;
        let writer = AppendWriter::new(Arc::new(faulty), fast_policy());

        let receipt = writer
            .append_records("buf", ["{\"new\":1}"], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.recreations, 1);
        assert_eq!(receipt.offset, 0);
        assert_eq!(
            memory.read_all("buf").await.unwrap(),
            Bytes::from_static(b"{\"new\":1}\n")
        );
        // The snapshot never sees the new record
        assert_eq!(
            memory.read_all("buf.compacting.1").await.unwrap(),
            Bytes::from_static(b"{\"old\":1}\n")
        );
    }

    #[tokio::test]
    async fn test_persistent_disappearance_is_fatal() {
        let faulty = FaultyBlobStore::new(MemoryBlobStore::new());
        faulty
            .fail_times(StoreOp::Append, None, 10, Fault::Fail(FaultError::NotFound))
            .await;
        let faulty = Arc::new(faulty);
        let writer = AppendWriter::new(faulty.clone(), fast_policy());

        let err = writer
            .append_records("buf", ["{}"], &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            CompactorError::RecreationExhausted { path, attempts, .. } => {
                assert_eq!(path, "buf");
                assert_eq!(attempts, DEFAULT_MAX_RECREATE_ATTEMPTS);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(faulty.calls(StoreOp::Append).await, 3);
    }

    #[tokio::test]
    async fn test_invalid_records_touch_nothing() {
        let memory = MemoryBlobStore::new();
        let writer = AppendWriter::new(Arc::new(memory.clone()), fast_policy());
        let err = writer
            .append_records("buf", ["{}", ""], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CompactorError::InvalidRecord { index: 1, .. }));
        assert!(memory.paths().await.is_empty());
    }
}
