//! Filesystem provider.
//!
//! Hands out one [`FileSystem`] per URI authority, each stored under its
//! own directory of the cache root. For example `cache://example.org/a.png`
//! opens (or reuses) the filesystem at `<cache root>/example.org`, with
//! defaults read from `<cache root>/example.org.toml`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, FileSystemUri, cache_root};
use crate::filesystem::FileSystem;
use crate::path::LogicalPath;
use crate::registry::Registry;
use crate::store::StoreResult;

/// Authority → filesystem cache.
#[derive(Debug)]
pub struct FileSystemProvider {
    cache_root: PathBuf,
    registry: Arc<Registry>,
    defaults: Config,
    filesystems: DashMap<String, Arc<FileSystem>>,
    /// Serializes creation so one authority never opens twice.
    creating: Mutex<()>,
}

impl FileSystemProvider {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            registry: Registry::builtin(),
            defaults: Config::new(),
            filesystems: DashMap::new(),
            creating: Mutex::new(()),
        }
    }

    /// Provider rooted at `$CACHEFS_BASE` or the platform cache directory.
    pub fn from_env() -> StoreResult<Self> {
        Ok(Self::new(cache_root()?))
    }

    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    /// Settings applied to every filesystem, above the per-authority file.
    pub fn with_defaults(mut self, defaults: Config) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Resolve `uri` to its filesystem and a path owned by it.
    ///
    /// The first open of an authority layers `<authority>.toml`, the
    /// provider defaults and the URI query, in that order. Later opens
    /// reuse the filesystem and ignore their query.
    pub async fn open(&self, uri: &str) -> StoreResult<(Arc<FileSystem>, LogicalPath)> {
        let parsed = FileSystemUri::parse(uri)?;
        let fs = self.filesystem_for(&parsed).await?;
        let path = fs.path(&parsed.path)?;
        Ok((fs, path))
    }

    /// The open filesystem for `authority`, if any.
    pub fn get(&self, authority: &str) -> Option<Arc<FileSystem>> {
        self.filesystems
            .get(authority)
            .map(|fs| fs.clone())
            .filter(|fs| fs.is_open())
    }

    pub fn authorities(&self) -> Vec<String> {
        self.filesystems.iter().map(|e| e.key().clone()).collect()
    }

    async fn filesystem_for(&self, uri: &FileSystemUri) -> StoreResult<Arc<FileSystem>> {
        if let Some(fs) = self.get(&uri.authority) {
            return Ok(fs);
        }

        let _creating = self.creating.lock().await;
        if let Some(fs) = self.get(&uri.authority) {
            return Ok(fs);
        }

        let file = self.cache_root.join(format!("{}.toml", uri.authority));
        let config = Config::from_toml_file(&file)?
            .merged(&self.defaults)
            .merged(&uri.query);
        debug!(authority = %uri.authority, config = ?config, "opening filesystem");

        let base = self.cache_root.join(&uri.authority);
        let fs = Arc::new(FileSystem::open_with_registry(&self.registry, &base, &config).await?);
        self.filesystems.insert(uri.authority.clone(), fs.clone());
        info!(
            authority = %uri.authority,
            base = %fs.base_directory().display(),
            "registered filesystem"
        );
        Ok(fs)
    }

    /// Close and forget the filesystem for `authority`. Returns whether one
    /// was open.
    pub async fn close(&self, authority: &str) -> StoreResult<bool> {
        let Some((_, fs)) = self.filesystems.remove(authority) else {
            return Ok(false);
        };
        fs.close().await?;
        Ok(true)
    }

    /// Close every filesystem concurrently. Failures are logged; the first
    /// is returned.
    pub async fn close_all(&self) -> StoreResult<()> {
        let authorities = self.authorities();
        let results = join_all(authorities.iter().map(|authority| self.close(authority))).await;

        let mut first_error = None;
        for (authority, result) in authorities.iter().zip(results) {
            if let Err(e) = result {
                warn!(authority = %authority, error = %e, "failed to close filesystem");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
