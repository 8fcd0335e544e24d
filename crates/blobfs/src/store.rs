use crate::error::BlobError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;

pub type Result<T> = std::result::Result<T, BlobError>;

/// How `create` treats an object that is already present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Fail with `AlreadyExists`
    IfAbsent,
    /// Truncate to zero length
    Overwrite,
}

/// Remote hierarchical object store with append/commit semantics.
///
/// Paths are `/`-separated strings relative to the store root. Appended
/// bytes are staged and become visible only when `commit` advances the
/// object's length past them.
#[async_trait]
pub trait BlobStore: Send + Sync + Debug {
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Committed length. `NotFound` if absent.
    async fn get_length(&self, path: &str) -> Result<u64>;

    async fn create(&self, path: &str, mode: CreateMode) -> Result<()>;

    /// Stage `data` at `at_offset`. `NotFound` if the object was renamed
    /// or deleted since the offset was read.
    async fn append(&self, path: &str, data: Bytes, at_offset: u64) -> Result<()>;

    /// Make staged bytes visible up to `new_length`.
    async fn commit(&self, path: &str, new_length: u64) -> Result<()>;

    /// Atomic. `NotFound` if `from` is absent, `AlreadyExists` if `to` is present.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Deleting an absent object succeeds.
    async fn delete(&self, path: &str) -> Result<()>;

    async fn read_all(&self, path: &str) -> Result<Bytes>;

    async fn create_empty(&self, path: &str) -> Result<()> {
        self.create(path, CreateMode::IfAbsent).await
    }

    /// Replace the whole object.
    ///
    /// This is the store's native create-append-commit sequence and is NOT
    /// atomic: a failure part way through leaves a short object behind.
    async fn upload(&self, path: &str, data: Bytes) -> Result<()> {
        let len = data.len() as u64;
        self.create(path, CreateMode::Overwrite).await?;
        if len > 0 {
            self.append(path, data, 0).await?;
        }
        self.commit(path, len).await
    }
}
