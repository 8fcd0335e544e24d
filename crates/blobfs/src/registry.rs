use crate::error::BlobError;
use crate::object::ObjectBlobStore;
use crate::store::{BlobStore, Result};
use diagnostics::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Named blob stores, built once at startup and shared by reference.
#[derive(Debug, Clone, Default)]
pub struct StoreRegistry {
    stores: HashMap<String, Arc<dyn BlobStore>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open one `ObjectBlobStore` per `(name, url)` pair
    pub fn from_urls<I, N, U>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, U)>,
        N: Into<String>,
        U: AsRef<str>,
    {
        let mut registry = Self::new();
        for (name, url) in entries {
            let name = name.into();
            let store = ObjectBlobStore::from_url(url.as_ref())?;
            log_debug!("Opened store {name} at {url}", name: name.as_str(), url: url.as_ref());
            registry.insert(name, Arc::new(store));
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, store: Arc<dyn BlobStore>) {
        self.stores.insert(name.into(), store);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BlobStore>> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| BlobError::Config(format!("Unknown store '{name}'")))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stores.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
