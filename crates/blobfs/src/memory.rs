use crate::error::BlobError;
use crate::store::{BlobStore, CreateMode, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One object: the visible bytes plus uncommitted bytes staged after them
#[derive(Debug, Default, Clone)]
struct MemoryBlob {
    committed: Vec<u8>,
    staged: Vec<u8>,
}

impl MemoryBlob {
    fn staged_end(&self) -> u64 {
        (self.committed.len() + self.staged.len()) as u64
    }
}

/// In-memory blob store for tests and local tooling.
///
/// Cloning shares the underlying objects.
#[derive(Debug, Default, Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<BTreeMap<String, MemoryBlob>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object with committed content
    pub async fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        let mut blobs = self.blobs.lock().await;
        blobs.insert(
            path.to_string(),
            MemoryBlob {
                committed: data.into(),
                staged: Vec::new(),
            },
        );
    }

    /// All object paths, sorted
    pub async fn paths(&self) -> Vec<String> {
        self.blobs.lock().await.keys().cloned().collect()
    }

    /// Object paths that start with `prefix`
    pub async fn paths_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.blobs
            .lock()
            .await
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.blobs.lock().await.contains_key(path))
    }

    async fn get_length(&self, path: &str) -> Result<u64> {
        let blobs = self.blobs.lock().await;
        blobs
            .get(path)
            .map(|b| b.committed.len() as u64)
            .ok_or_else(|| BlobError::not_found(path))
    }

    async fn create(&self, path: &str, mode: CreateMode) -> Result<()> {
        let mut blobs = self.blobs.lock().await;
        if mode == CreateMode::IfAbsent && blobs.contains_key(path) {
            return Err(BlobError::already_exists(path));
        }
        blobs.insert(path.to_string(), MemoryBlob::default());
        Ok(())
    }

    async fn append(&self, path: &str, data: Bytes, at_offset: u64) -> Result<()> {
        let mut blobs = self.blobs.lock().await;
        let blob = blobs
            .get_mut(path)
            .ok_or_else(|| BlobError::not_found(path))?;

        // Appending inside the staged region replaces uncommitted bytes,
        // so a retried append at the same offset is harmless.
        let committed = blob.committed.len() as u64;
        if at_offset < committed || at_offset > blob.staged_end() {
            return Err(BlobError::InvalidRange {
                path: path.to_string(),
                expected: blob.staged_end(),
                actual: at_offset,
            });
        }
        blob.staged.truncate((at_offset - committed) as usize);
        blob.staged.extend_from_slice(&data);
        Ok(())
    }

    async fn commit(&self, path: &str, new_length: u64) -> Result<()> {
        let mut blobs = self.blobs.lock().await;
        let blob = blobs
            .get_mut(path)
            .ok_or_else(|| BlobError::not_found(path))?;

        let committed = blob.committed.len() as u64;
        if new_length < committed || new_length > blob.staged_end() {
            return Err(BlobError::InvalidRange {
                path: path.to_string(),
                expected: blob.staged_end(),
                actual: new_length,
            });
        }
        let take = (new_length - committed) as usize;
        let staged = std::mem::take(&mut blob.staged);
        blob.committed.extend_from_slice(&staged[..take]);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut blobs = self.blobs.lock().await;
        if !blobs.contains_key(from) {
            return Err(BlobError::not_found(from));
        }
        if blobs.contains_key(to) {
            return Err(BlobError::already_exists(to));
        }
        if let Some(blob) = blobs.remove(from) {
            blobs.insert(to.to_string(), blob);
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.blobs.lock().await.remove(path);
        Ok(())
    }

    async fn read_all(&self, path: &str) -> Result<Bytes> {
        let blobs = self.blobs.lock().await;
        blobs
            .get(path)
            .map(|b| Bytes::copy_from_slice(&b.committed))
            .ok_or_else(|| BlobError::not_found(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_staged_bytes_invisible_until_commit() {
        let store = MemoryBlobStore::new();
        store.create_empty("buf").await.unwrap();
        store.append("buf", Bytes::from_static(b"abc\n"), 0).await.unwrap();

        assert_eq!(store.get_length("buf").await.unwrap(), 0);
        assert!(store.read_all("buf").await.unwrap().is_empty());

        store.commit("buf", 4).await.unwrap();
        assert_eq!(store.get_length("buf").await.unwrap(), 4);
        assert_eq!(store.read_all("buf").await.unwrap(), Bytes::from_static(b"abc\n"));
    }

    #[tokio::test]
    async fn test_reappend_at_same_offset_replaces_uncommitted() {
        let store = MemoryBlobStore::new();
        store.create_empty("buf").await.unwrap();
        store.append("buf", Bytes::from_static(b"first"), 0).await.unwrap();
        store.append("buf", Bytes::from_static(b"again"), 0).await.unwrap();
        store.commit("buf", 5).await.unwrap();
        assert_eq!(store.read_all("buf").await.unwrap(), Bytes::from_static(b"again"));
    }

    #[tokio::test]
    async fn test_append_past_end_is_rejected() {
        let store = MemoryBlobStore::new();
        store.insert("buf", b"xy".to_vec()).await;
        let err = store
            .append("buf", Bytes::from_static(b"z"), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::InvalidRange { expected: 2, actual: 5, .. }));

        let err = store.commit("buf", 9).await.unwrap_err();
        assert!(matches!(err, BlobError::InvalidRange { .. }));
    }

    #[tokio::test]
    async fn test_create_if_absent() {
        let store = MemoryBlobStore::new();
        store.create_empty("a").await.unwrap();
        assert!(store.create_empty("a").await.unwrap_err().is_already_exists());
        store.create("a", CreateMode::Overwrite).await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_semantics() {
        let store = MemoryBlobStore::new();
        store.insert("a", b"1".to_vec()).await;
        store.insert("b", b"2".to_vec()).await;

        assert!(store.rename("missing", "c").await.unwrap_err().is_not_found());
        assert!(store.rename("a", "b").await.unwrap_err().is_already_exists());

        store.rename("a", "c").await.unwrap();
        assert!(!store.exists("a").await.unwrap());
        assert_eq!(store.read_all("c").await.unwrap(), Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn test_append_after_rename_is_not_found() {
        let store = MemoryBlobStore::new();
        store.create_empty("buf").await.unwrap();
        let offset = store.get_length("buf").await.unwrap();
        store.rename("buf", "buf.compacting.1").await.unwrap();

        let err = store
            .append("buf", Bytes::from_static(b"late\n"), offset)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.get_length("buf.compacting.1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_upload_replaces() {
        let store = MemoryBlobStore::new();
        store.delete("nothing").await.unwrap();

        store.insert("t", b"old content".to_vec()).await;
        store.upload("t", Bytes::from_static(b"new")).await.unwrap();
        assert_eq!(store.read_all("t").await.unwrap(), Bytes::from_static(b"new"));
        assert_eq!(store.paths().await, vec!["t".to_string()]);
    }
}
