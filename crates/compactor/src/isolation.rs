//! Isolating a buffer for compaction
//!
//! A buffer is detached by renaming it to `<buffer>.compacting.<ts>`. Once
//! the rename succeeds the snapshot is closed: appenders that still hold
//! the old name fail with `NotFound` and start a fresh buffer.

use crate::error::Result;
use crate::resilience::{ResiliencePolicy, RetryClass};
use blobfs::BlobStore;
use diagnostics::*;
use tokio_util::sync::CancellationToken;

const COMPACTING_INFIX: &str = ".compacting.";
const FAILED_INFIX: &str = ".failed.";

/// A buffer snapshot detached from its writers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedBuffer {
    pub buffer_path: String,
    pub path: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl IsolatedBuffer {
    /// Where this snapshot goes if compacting it fails
    pub fn failed_path(&self) -> String {
        failed_path(&self.buffer_path, self.timestamp)
    }
}

pub fn compacting_path(buffer: &str, timestamp: i64) -> String {
    format!("{buffer}{COMPACTING_INFIX}{timestamp}")
}

pub fn failed_path(buffer: &str, timestamp: i64) -> String {
    format!("{buffer}{FAILED_INFIX}{timestamp}")
}

/// Recognize `<buffer>.failed.<ts>` paths, returning the buffer and timestamp
pub fn parse_failed_path(path: &str) -> Option<(&str, i64)> {
    let (buffer, timestamp) = path.rsplit_once(FAILED_INFIX)?;
    Some((buffer, timestamp.parse().ok()?))
}

/// Rename `buffer` out of the way of its writers.
///
/// `None` when there is no buffer, which is not an error.
pub async fn isolate(
    store: &dyn BlobStore,
    policy: &ResiliencePolicy,
    buffer: &str,
    cancel: &CancellationToken,
) -> Result<Option<IsolatedBuffer>> {
    let exists = policy
        .execute(
            RetryClass::Metadata,
            &format!("check {buffer}"),
            cancel,
            |_| async move { Ok(store.exists(buffer).await?) },
        )
        .await?;
    if !exists {
        log_debug!("No buffer at {buffer}, nothing to isolate", buffer: buffer);
        return Ok(None);
    }

    let timestamp = chrono::Utc::now().timestamp_millis();
    let path = compacting_path(buffer, timestamp);

    let renamed = policy
        .execute(
            RetryClass::Mutation,
            &format!("isolate {buffer}"),
            cancel,
            |ctx| {
                let path = &path;
                async move {
                    match store.rename(buffer, path).await {
                        Ok(()) => Ok(true),
                        Err(e) if e.is_not_found() => {
                            // A retry after a lost response finds the rename already done
                            Ok(ctx.is_retry() && store.exists(path).await?)
                        }
                        Err(e) => Err(e.into()),
                    }
                }
            },
        )
        .await?;

    if !renamed {
        log_debug!("Buffer {buffer} vanished before it could be isolated", buffer: buffer);
        return Ok(None);
    }

    log_debug!("Isolated {buffer} as {path}", buffer: buffer, path: path.as_str());
    Ok(Some(IsolatedBuffer {
        buffer_path: buffer.to_string(),
        path,
        timestamp,
    }))
}
