//! Fault injection for exercising retry, recovery and cleanup paths
//!
//! `FaultyBlobStore` wraps any store and consults a script of faults
//! before each operation. Faults are consumed in the order they were
//! added; an operation with no matching fault passes straight through.

use crate::error::{BlobError, TransientKind};
use crate::store::{BlobStore, CreateMode, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Exists,
    GetLength,
    Create,
    Append,
    Commit,
    Rename,
    Delete,
    ReadAll,
}

/// Error to synthesize
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultError {
    Throttled,
    Unavailable,
    Timeout,
    NotFound,
    AlreadyExists,
    Fatal(String),
}

impl FaultError {
    fn to_blob_error(&self, path: &str) -> BlobError {
        match self {
            FaultError::Throttled => {
                BlobError::transient(TransientKind::Throttled, format!("injected 429 on {path}"))
            }
            FaultError::Unavailable => {
                BlobError::transient(TransientKind::Unavailable, format!("injected 503 on {path}"))
            }
            FaultError::Timeout => {
                BlobError::transient(TransientKind::Timeout, format!("injected timeout on {path}"))
            }
            FaultError::NotFound => BlobError::not_found(path),
            FaultError::AlreadyExists => BlobError::already_exists(path),
            FaultError::Fatal(msg) => BlobError::Config(format!("injected failure: {msg}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail without touching the inner store
    Fail(FaultError),
    /// Let the operation happen, then report failure anyway (lost response)
    FailAfter(FaultError),
    /// Rename the target path away first, as a concurrent compaction would
    RenameAway { to: String },
    /// Commit only the first `keep` bytes but report success
    ShortCommit { keep: u64 },
}

#[derive(Debug)]
struct ScriptedFault {
    op: StoreOp,
    path_filter: Option<String>,
    fault: Fault,
    remaining: usize,
}

#[derive(Debug, Clone)]
pub struct FaultyBlobStore<S> {
    inner: S,
    script: Arc<Mutex<Vec<ScriptedFault>>>,
    calls: Arc<Mutex<HashMap<StoreOp, usize>>>,
}

impl<S: BlobStore> FaultyBlobStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            script: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Inject `fault` on the next `op`, whatever the path
    pub async fn fail_next(&self, op: StoreOp, fault: Fault) {
        self.fail_times(op, None, 1, fault).await;
    }

    /// Inject `fault` on the next `times` calls of `op` whose path contains `path_filter`
    pub async fn fail_times(
        &self,
        op: StoreOp,
        path_filter: Option<&str>,
        times: usize,
        fault: Fault,
    ) {
        self.script.lock().await.push(ScriptedFault {
            op,
            path_filter: path_filter.map(str::to_string),
            fault,
            remaining: times,
        });
    }

    /// How many times `op` has been attempted, faulted or not
    pub async fn calls(&self, op: StoreOp) -> usize {
        self.calls.lock().await.get(&op).copied().unwrap_or(0)
    }

    pub async fn pending_faults(&self) -> usize {
        self.script.lock().await.iter().map(|f| f.remaining).sum()
    }

    async fn take_fault(&self, op: StoreOp, path: &str) -> Option<Fault> {
        *self.calls.lock().await.entry(op).or_insert(0) += 1;

        let mut script = self.script.lock().await;
        let index = script.iter().position(|f| {
            f.op == op
                && f.remaining > 0
                && f.path_filter.as_deref().is_none_or(|p| path.contains(p))
        })?;
        let entry = &mut script[index];
        entry.remaining -= 1;
        let fault = entry.fault.clone();
        if entry.remaining == 0 {
            script.remove(index);
        }
        Some(fault)
    }

    /// Apply the pre-operation part of a fault. Returns the fault still
    /// owed after the operation runs, if any.
    async fn before(&self, op: StoreOp, path: &str) -> Result<Option<Fault>> {
        match self.take_fault(op, path).await {
            None => Ok(None),
            Some(Fault::Fail(err)) => Err(err.to_blob_error(path)),
            Some(Fault::RenameAway { to }) => {
                self.inner.rename(path, &to).await?;
                Ok(None)
            }
            Some(other) => Ok(Some(other)),
        }
    }

    fn after<T>(result: Result<T>, owed: Option<Fault>, path: &str) -> Result<T> {
        match owed {
            Some(Fault::FailAfter(err)) => {
                result?;
                Err(err.to_blob_error(path))
            }
            _ => result,
        }
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for FaultyBlobStore<S> {
    async fn exists(&self, path: &str) -> Result<bool> {
        let owed = self.before(StoreOp::Exists, path).await?;
        Self::after(self.inner.exists(path).await, owed, path)
    }

    async fn get_length(&self, path: &str) -> Result<u64> {
        let owed = self.before(StoreOp::GetLength, path).await?;
        Self::after(self.inner.get_length(path).await, owed, path)
    }

    async fn create(&self, path: &str, mode: CreateMode) -> Result<()> {
        let owed = self.before(StoreOp::Create, path).await?;
        Self::after(self.inner.create(path, mode).await, owed, path)
    }

    async fn append(&self, path: &str, data: Bytes, at_offset: u64) -> Result<()> {
        let owed = self.before(StoreOp::Append, path).await?;
        Self::after(self.inner.append(path, data, at_offset).await, owed, path)
    }

    async fn commit(&self, path: &str, new_length: u64) -> Result<()> {
        let owed = self.before(StoreOp::Commit, path).await?;
        if let Some(Fault::ShortCommit { keep }) = owed {
            let committed = self.inner.get_length(path).await?;
            return self
                .inner
                .commit(path, new_length.min(committed.max(keep)))
                .await;
        }
        Self::after(self.inner.commit(path, new_length).await, owed, path)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let owed = self.before(StoreOp::Rename, from).await?;
        Self::after(self.inner.rename(from, to).await, owed, from)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let owed = self.before(StoreOp::Delete, path).await?;
        Self::after(self.inner.delete(path).await, owed, path)
    }

    async fn read_all(&self, path: &str) -> Result<Bytes> {
        let owed = self.before(StoreOp::ReadAll, path).await?;
        Self::after(self.inner.read_all(path).await, owed, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlobStore;

    #[tokio::test]
    async fn test_fail_next_is_consumed_once() {
        let store = FaultyBlobStore::new(MemoryBlobStore::new());
        store
            .fail_next(StoreOp::Exists, Fault::Fail(FaultError::Throttled))
            .await;

        let err = store.exists("a").await.unwrap_err();
        assert!(err.is_transient());
        assert!(!store.exists("a").await.unwrap());
        assert_eq!(store.calls(StoreOp::Exists).await, 2);
        assert_eq!(store.pending_faults().await, 0);
    }

    #[tokio::test]
    async fn test_fail_after_still_mutates() {
        let store = FaultyBlobStore::new(MemoryBlobStore::new());
        store.inner().insert("a", b"x".to_vec()).await;
        store
            .fail_next(StoreOp::Rename, Fault::FailAfter(FaultError::Unavailable))
            .await;

        assert!(store.rename("a", "b").await.is_err());
        assert!(store.inner().exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_short_commit_truncates_silently() {
        let store = FaultyBlobStore::new(MemoryBlobStore::new());
        store
            .fail_next(StoreOp::Commit, Fault::ShortCommit { keep: 3 })
            .await;

        store.upload("t", Bytes::from_static(b"0123456789")).await.unwrap();
        assert_eq!(store.get_length("t").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_path_filter() {
        let store = FaultyBlobStore::new(MemoryBlobStore::new());
        store
            .fail_times(StoreOp::Create, Some("target"), 1, Fault::Fail(FaultError::Timeout))
            .await;

        store.create_empty("buffer").await.unwrap();
        assert!(store.create_empty("target").await.is_err());
        store.create_empty("target").await.unwrap();
    }
}
