use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use blobfs::{BlobStore, ObjectBlobStore, StoreRegistry};
use compactor::{BufpondConfig, Compactor};

/// Store used when `--store` is not given
pub const DEFAULT_STORE: &str = "default";

/// Environment variable naming the root directory of the default store
pub const ROOT_ENV: &str = "BUFPOND";

/// Everything a command needs: the configuration and the selected store
#[derive(Debug)]
pub struct StoreContext {
    pub config: BufpondConfig,
    pub registry: StoreRegistry,
    pub store_name: String,
}

impl StoreContext {
    /// Load `config_path` if given and select `store_name`.
    ///
    /// Without a configured `default` store, one is rooted at `$BUFPOND`
    /// or the current directory.
    pub fn open(config_path: Option<&Path>, store_name: Option<&str>) -> Result<Self> {
        let config = match config_path {
            Some(path) => BufpondConfig::from_yaml_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => BufpondConfig::default(),
        };

        let mut registry = config.open_stores()?;
        if !config.stores.contains_key(DEFAULT_STORE) {
            let root = default_root()?;
            registry.insert(DEFAULT_STORE, open_directory(&root)?);
        }

        let store_name = store_name.unwrap_or(DEFAULT_STORE).to_string();
        // Fail early on an unknown name
        let _ = registry.get(&store_name)?;

        Ok(Self {
            config,
            registry,
            store_name,
        })
    }

    /// A context over a single explicit store, for tools and tests
    pub fn with_store(store: Arc<dyn BlobStore>, config: BufpondConfig) -> Self {
        let mut registry = StoreRegistry::new();
        registry.insert(DEFAULT_STORE, store);
        Self {
            config,
            registry,
            store_name: DEFAULT_STORE.to_string(),
        }
    }

    pub fn store(&self) -> Result<Arc<dyn BlobStore>> {
        Ok(self.registry.get(&self.store_name)?)
    }

    pub fn compactor(&self) -> Result<Compactor> {
        Ok(Compactor::from_config(self.store()?, &self.config))
    }
}

/// `$BUFPOND`, or the current directory
pub fn default_root() -> Result<PathBuf> {
    match env::var(ROOT_ENV) {
        Ok(val) if !val.is_empty() => Ok(PathBuf::from(val)),
        _ => env::current_dir().map_err(|e| anyhow!("Cannot determine current directory: {e}")),
    }
}

/// A file-backed store rooted at `root`, created if needed
pub fn open_directory(root: &Path) -> Result<Arc<dyn BlobStore>> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("Failed to create store root {}", root.display()))?;
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve store root {}", root.display()))?;
    let url = format!("file://{}", root.display());
    Ok(Arc::new(ObjectBlobStore::from_url(&url)?))
}
