//! Store capability trait.
//!
//! Every layer of a filesystem (the local store, each overlay) implements
//! [`Store`]. Overlays hold the next layer as `Arc<dyn Store>` and delegate
//! whatever they do not intercept, so chains are built by folding
//! decorators over a base store.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::types::{CopyOptions, DirEntry, FileAttr, SweepReport, WriteMode};
use super::StoreResult;
use crate::path::LogicalPath;

/// Byte stream returned by [`Store::open_read`].
pub type StoreReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write handle returned by [`Store::open_write`].
///
/// Bytes become visible at the target only once `close` succeeds.
/// `close` is idempotent: a second call does nothing and returns `Ok`.
#[async_trait]
pub trait StoreWriter: Send {
    /// Append `buf` to the pending contents.
    async fn write(&mut self, buf: &[u8]) -> StoreResult<()>;

    /// Publish the contents.
    async fn close(&mut self) -> StoreResult<()>;
}

/// Core store operations.
///
/// Paths are logical; each store maps them to physical locations itself.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Check whether the path has a local backing.
    async fn exists(&self, path: &LogicalPath) -> StoreResult<bool>;

    /// Create a directory and its parents.
    async fn create_dir(&self, path: &LogicalPath) -> StoreResult<()>;

    /// Open a file for reading. Fails with `NotFound` if absent.
    async fn open_read(&self, path: &LogicalPath) -> StoreResult<StoreReader>;

    /// Open a file for writing, creating parent directories.
    async fn open_write(
        &self,
        path: &LogicalPath,
        mode: WriteMode,
    ) -> StoreResult<Box<dyn StoreWriter>>;

    /// Delete a file or an empty directory.
    ///
    /// Returns whether anything was deleted. An absent path is an error
    /// only when `must_exist` is set.
    async fn delete(&self, path: &LogicalPath, must_exist: bool) -> StoreResult<bool>;

    /// Copy within this store.
    async fn copy(&self, from: &LogicalPath, to: &LogicalPath, opts: CopyOptions)
    -> StoreResult<()>;

    /// Rename within this store.
    async fn rename(
        &self,
        from: &LogicalPath,
        to: &LogicalPath,
        opts: CopyOptions,
    ) -> StoreResult<()>;

    /// Get attributes.
    async fn stat(&self, path: &LogicalPath) -> StoreResult<FileAttr>;

    /// List a directory, sorted by name.
    async fn list(&self, path: &LogicalPath) -> StoreResult<Vec<DirEntry>>;

    /// Physical root of the chain.
    fn base_directory(&self) -> &Path;

    /// Run one eviction sweep with the given age cutoff.
    async fn expire(&self, max_age: Duration) -> StoreResult<SweepReport>;

    /// Release resources. Idempotent.
    async fn close(&self) -> StoreResult<()>;

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Size in bytes.
    async fn size(&self, path: &LogicalPath) -> StoreResult<u64> {
        Ok(self.stat(path).await?.size)
    }

    /// Read entire file contents.
    async fn read_all(&self, path: &LogicalPath) -> StoreResult<Vec<u8>> {
        let mut reader = self.open_read(path).await?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| super::StoreError::io(path.as_str(), e))?;
        Ok(buf)
    }

    /// Truncate and write the whole file.
    async fn write_all(&self, path: &LogicalPath, data: &[u8]) -> StoreResult<()> {
        let mut writer = self.open_write(path, WriteMode::Truncate).await?;
        writer.write(data).await?;
        writer.close().await
    }
}
