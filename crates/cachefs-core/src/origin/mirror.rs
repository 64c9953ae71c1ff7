//! Directory mirror origin.
//!
//! Treats another local directory as the remote side of an overlay: misses
//! are copied in from it, closed writes are copied back to it. Logical
//! paths map flat onto the mirror root regardless of the cache layout.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::{REMOTE_DIRECTORY, REMOTE_READ_ONLY};
use crate::overlay::{Overlay, Retriever, Sender, copy_from_remote};
use crate::path::LogicalPath;
use crate::registry::WrapperContext;
use crate::store::{Store, StoreError, StoreResult};

/// Registry name of the mirror wrapper.
pub const MIRROR: &str = "mirror";

/// A local directory acting as origin.
#[derive(Debug, Clone)]
pub struct DirectoryOrigin {
    root: PathBuf,
}

impl DirectoryOrigin {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Origin file for `path`. The key is dot-free, so it stays under root.
    fn origin_path(&self, path: &LogicalPath) -> StoreResult<PathBuf> {
        let key = path.resolved_key();
        if key.is_empty() {
            return Err(StoreError::is_a_directory(path.as_str()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl Retriever for DirectoryOrigin {
    async fn retrieve(&self, path: &LogicalPath, store: &dyn Store) -> StoreResult<()> {
        let source = self.origin_path(path)?;
        let file = match fs::File::open(&source).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::not_found(path.as_str()));
            }
            Err(e) => return Err(StoreError::remote(path.as_str(), e.to_string())),
        };
        let meta = file
            .metadata()
            .await
            .map_err(|e| StoreError::remote(path.as_str(), e.to_string()))?;
        if meta.is_dir() {
            store.create_dir(path).await?;
            return Ok(());
        }

        let copied = copy_from_remote(file, store, path).await?;
        debug!(path = %path, origin = %source.display(), bytes = copied, "mirrored in");
        Ok(())
    }
}

#[async_trait]
impl Sender for DirectoryOrigin {
    async fn send(&self, path: &LogicalPath, store: &dyn Store) -> StoreResult<()> {
        let target = self.origin_path(path)?;
        let remote = |e: std::io::Error| StoreError::remote(path.as_str(), e.to_string());

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(remote)?;
        }
        let mut reader = store.open_read(path).await?;
        let mut file = fs::File::create(&target).await.map_err(remote)?;
        let copied = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(remote)?;
        file.flush().await.map_err(remote)?;

        debug!(path = %path, origin = %target.display(), bytes = copied, "mirrored out");
        Ok(())
    }
}

/// Wrapper constructor registered as [`MIRROR`].
///
/// Requires `remoteDirectory`. With `remoteReadOnly` set the overlay only
/// retrieves.
pub fn mirror_wrapper(next: Arc<dyn Store>, ctx: &WrapperContext) -> StoreResult<Arc<dyn Store>> {
    let config = ctx.config();
    let root = config
        .get(REMOTE_DIRECTORY)
        .filter(|dir| !dir.trim().is_empty())
        .ok_or_else(|| {
            StoreError::config(format!("{MIRROR} wrapper requires {REMOTE_DIRECTORY}"))
        })?;

    let origin = Arc::new(DirectoryOrigin::new(root));
    let mut overlay = Overlay::new(next)
        .with_retriever(origin.clone())
        .with_synchronizer(ctx.synchronizer());
    if !config.is_true(REMOTE_READ_ONLY) {
        overlay = overlay.with_sender(origin);
    }
    Ok(Arc::new(overlay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mapper::ContentHashMapper;
    use crate::store::{LocalStore, LocalStoreOptions};
    use tempfile::TempDir;

    async fn cache_store(dir: &TempDir) -> Arc<dyn Store> {
        Arc::new(
            LocalStore::open(
                dir.path(),
                Arc::new(ContentHashMapper),
                LocalStoreOptions::default(),
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_retrieve_copies_origin_file() {
        let (origin_dir, cache_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        std::fs::create_dir_all(origin_dir.path().join("img")).unwrap();
        std::fs::write(origin_dir.path().join("img/a.png"), b"png bytes").unwrap();

        let origin = DirectoryOrigin::new(origin_dir.path());
        let store = cache_store(&cache_dir).await;
        let path = LogicalPath::new("/img/a.png").unwrap();

        origin.retrieve(&path, store.as_ref()).await.unwrap();
        assert_eq!(store.read_all(&path).await.unwrap(), b"png bytes");
    }

    #[tokio::test]
    async fn test_retrieve_missing_is_not_found() {
        let (origin_dir, cache_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let origin = DirectoryOrigin::new(origin_dir.path());
        let store = cache_store(&cache_dir).await;

        let err = origin
            .retrieve(&LogicalPath::new("/nope").unwrap(), store.as_ref())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_send_creates_origin_parents() {
        let (origin_dir, cache_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let origin = DirectoryOrigin::new(origin_dir.path());
        let store = cache_store(&cache_dir).await;
        let path = LogicalPath::new("/deep/er/b.txt").unwrap();
        store.write_all(&path, b"outbound").await.unwrap();

        origin.send(&path, store.as_ref()).await.unwrap();
        assert_eq!(
            std::fs::read(origin_dir.path().join("deep/er/b.txt")).unwrap(),
            b"outbound"
        );
    }

    #[tokio::test]
    async fn test_wrapper_requires_remote_directory() {
        let cache_dir = TempDir::new().unwrap();
        let store = cache_store(&cache_dir).await;
        let ctx = WrapperContext::new(Config::new());

        let err = mirror_wrapper(store, &ctx).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[tokio::test]
    async fn test_read_only_mirror_does_not_push() {
        let (origin_dir, cache_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let store = cache_store(&cache_dir).await;
        let config = Config::new()
            .with(REMOTE_DIRECTORY, origin_dir.path().display())
            .with(REMOTE_READ_ONLY, "true");
        let top = mirror_wrapper(store, &WrapperContext::new(config)).unwrap();

        let path = LogicalPath::new("/local-only.txt").unwrap();
        top.write_all(&path, b"stays here").await.unwrap();

        assert_eq!(top.read_all(&path).await.unwrap(), b"stays here");
        assert!(!origin_dir.path().join("local-only.txt").exists());
    }
}
