//! Blob store on top of any `object_store::ObjectStore`
//!
//! Object stores only offer whole-object puts, so uncommitted appends are
//! kept as sibling objects under `<path>.staging/<offset>` and folded into
//! the object by `commit`.
//!
//! `commit` and `rename` of a path hold a lock object,
//! `<path>.staging/lock`, created with `PutMode::Create`. A commit racing
//! a rename therefore either lands before it or finds the path gone; it
//! never writes the old bytes back under the renamed name. This matters
//! for backends such as `LocalFileSystem` that have no conditional put.
//! A lock older than [`LOCK_LEASE`] is presumed abandoned and broken.

use crate::error::{BlobError, TransientKind};
use crate::store::{BlobStore, CreateMode, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use diagnostics::*;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use std::sync::Arc;
use std::time::Duration;

const STAGING_SUFFIX: &str = ".staging";
const LOCK_NAME: &str = "lock";

/// How long a held lock is honoured
pub const LOCK_LEASE: Duration = Duration::from_secs(30);
const LOCK_POLL: Duration = Duration::from_millis(10);
const LOCK_ATTEMPTS: u32 = 200;

#[derive(Debug, Clone)]
pub struct ObjectBlobStore {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

/// One uncommitted range
struct StagedPart {
    offset: u64,
    location: Path,
}

impl ObjectBlobStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: Path::default(),
        }
    }

    /// Root every blob path under `prefix`
    pub fn with_prefix(store: Arc<dyn ObjectStore>, prefix: Path) -> Self {
        Self { store, prefix }
    }

    /// Build from a URL such as `memory://` or `file:///var/lib/bufpond`
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| BlobError::Config(format!("Invalid store URL '{url}': {e}")))?;
        let (store, prefix) = object_store::parse_url(&parsed).map_err(BlobError::from)?;
        Ok(Self::with_prefix(Arc::from(store), prefix))
    }

    fn location(&self, path: &str) -> Result<Path> {
        let full = if self.prefix.as_ref().is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        };
        Path::parse(&full).map_err(|e| BlobError::Config(format!("Invalid blob path '{path}': {e}")))
    }

    fn staging_prefix(&self, path: &str) -> Result<Path> {
        self.location(&format!("{path}{STAGING_SUFFIX}"))
    }

    fn lock_location(&self, path: &str) -> Result<Path> {
        self.location(&format!("{path}{STAGING_SUFFIX}/{LOCK_NAME}"))
    }

    /// Take the lock serializing `commit` and `rename` of `path`
    async fn lock(&self, path: &str) -> Result<Path> {
        let location = self.lock_location(path)?;
        for _ in 0..LOCK_ATTEMPTS {
            let opts = PutOptions::from(PutMode::Create);
            match self.store.put_opts(&location, PutPayload::new(), opts).await {
                Ok(_) => return Ok(location),
                Err(object_store::Error::AlreadyExists { .. }) => {
                    if self.lock_is_stale(&location).await? {
                        log_warn!("Breaking abandoned lock on {path}", path: path);
                        self.delete_location(&location).await?;
                        continue;
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(BlobError::transient(
            TransientKind::Unavailable,
            format!("{path} is locked by another writer"),
        ))
    }

    async fn lock_is_stale(&self, location: &Path) -> Result<bool> {
        match self.store.head(location).await {
            Ok(meta) => {
                let age = Utc::now().signed_duration_since(meta.last_modified);
                Ok(age.to_std().is_ok_and(|age| age > LOCK_LEASE))
            }
            // Released in the meantime
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self, path: &str, location: &Path) {
        if let Err(e) = self.delete_location(location).await {
            log_warn!(
                "Could not release lock on {path}: {error}",
                path: path,
                error: e.to_string()
            );
        }
    }

    async fn staged_parts(&self, path: &str) -> Result<Vec<StagedPart>> {
        let prefix = self.staging_prefix(path)?;
        let metas: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;

        let mut parts: Vec<StagedPart> = metas
            .into_iter()
            .filter_map(|meta| {
                let offset = meta.location.filename()?.parse::<u64>().ok()?;
                Some(StagedPart {
                    offset,
                    location: meta.location,
                })
            })
            .collect();
        parts.sort_by_key(|p| p.offset);
        Ok(parts)
    }

    async fn clear_staged(&self, path: &str, from_offset: u64) -> Result<()> {
        for part in self.staged_parts(path).await? {
            if part.offset >= from_offset {
                self.delete_location(&part.location).await?;
            }
        }
        Ok(())
    }

    async fn delete_location(&self, location: &Path) -> Result<()> {
        match self.store.delete(location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Where the contiguous staged region ends, starting from `committed`
    async fn staged_end(&self, path: &str, committed: u64) -> Result<u64> {
        let mut end = committed;
        for part in self.staged_parts(path).await? {
            if part.offset != end {
                continue;
            }
            let meta = self.store.head(&part.location).await?;
            end += meta.size;
        }
        Ok(end)
    }

    async fn put_conditional(
        &self,
        location: &Path,
        payload: Bytes,
        version: UpdateVersion,
    ) -> Result<()> {
        let opts = PutOptions::from(PutMode::Update(version));
        match self
            .store
            .put_opts(location, PutPayload::from(payload.clone()), opts)
            .await
        {
            Ok(_) => Ok(()),
            // Callers hold the path lock, so a plain put cannot race a rename
            Err(object_store::Error::NotImplemented) => {
                log_debug!(
                    "Backend lacks conditional put, overwriting {location}",
                    location: location.to_string()
                );
                self.store.put(location, PutPayload::from(payload)).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn commit_locked(&self, path: &str, new_length: u64) -> Result<()> {
        let location = self.location(path)?;
        let meta = self.store.head(&location).await?;
        if new_length < meta.size {
            return Err(BlobError::InvalidRange {
                path: path.to_string(),
                expected: meta.size,
                actual: new_length,
            });
        }
        if new_length == meta.size {
            return self.clear_staged(path, 0).await;
        }

        let current = self.store.get(&location).await?.bytes().await?;
        let mut combined = BytesMut::from(current.as_ref());
        for part in self.staged_parts(path).await? {
            if (combined.len() as u64) >= new_length {
                break;
            }
            if part.offset != combined.len() as u64 {
                continue;
            }
            let bytes = self.store.get(&part.location).await?.bytes().await?;
            combined.extend_from_slice(&bytes);
        }
        if (combined.len() as u64) < new_length {
            return Err(BlobError::InvalidRange {
                path: path.to_string(),
                expected: combined.len() as u64,
                actual: new_length,
            });
        }
        combined.truncate(new_length as usize);

        let version = UpdateVersion {
            e_tag: meta.e_tag,
            version: meta.version,
        };
        self.put_conditional(&location, combined.freeze(), version)
            .await
            .map_err(|e| match e {
                // The object vanished between head and put
                BlobError::Conflict(_) => BlobError::not_found(path),
                other => other,
            })?;
        self.clear_staged(path, 0).await
    }

    async fn rename_locked(&self, from: &str, to: &str) -> Result<()> {
        let from_location = self.location(from)?;
        let to_location = self.location(to)?;
        self.store
            .rename_if_not_exists(&from_location, &to_location)
            .await?;

        // Appends staged against `from` can no longer commit
        if let Err(e) = self.clear_staged(from, 0).await {
            log_warn!(
                "Could not clear staged parts of {from}: {error}",
                from: from,
                error: e.to_string()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        match self.store.head(&self.location(path)?).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_length(&self, path: &str) -> Result<u64> {
        let meta = self.store.head(&self.location(path)?).await?;
        Ok(meta.size)
    }

    async fn create(&self, path: &str, mode: CreateMode) -> Result<()> {
        let location = self.location(path)?;
        match mode {
            CreateMode::IfAbsent => {
                self.store
                    .put_opts(&location, PutPayload::new(), PutOptions::from(PutMode::Create))
                    .await?;
            }
            CreateMode::Overwrite => {
                self.store.put(&location, PutPayload::new()).await?;
            }
        }
        // Leftovers of an earlier object under the same name
        self.clear_staged(path, 0).await
    }

    async fn append(&self, path: &str, data: Bytes, at_offset: u64) -> Result<()> {
        let committed = self.get_length(path).await?;
        let end = self.staged_end(path, committed).await?;
        if at_offset < committed || at_offset > end {
            return Err(BlobError::InvalidRange {
                path: path.to_string(),
                expected: end,
                actual: at_offset,
            });
        }

        self.clear_staged(path, at_offset).await?;
        let part = self.location(&format!("{path}{STAGING_SUFFIX}/{at_offset:020}"))?;
        self.store.put(&part, PutPayload::from(data)).await?;
        Ok(())
    }

    async fn commit(&self, path: &str, new_length: u64) -> Result<()> {
        let lock = self.lock(path).await?;
        let result = self.commit_locked(path, new_length).await;
        self.unlock(path, &lock).await;
        result
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let lock = self.lock(from).await?;
        let result = self.rename_locked(from, to).await;
        self.unlock(from, &lock).await;
        result
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.delete_location(&self.location(path)?).await?;
        self.clear_staged(path, 0).await
    }

    async fn read_all(&self, path: &str) -> Result<Bytes> {
        let result = self.store.get(&self.location(path)?).await?;
        Ok(result.bytes().await?)
    }
}
