//! Filesystem handle.
//!
//! A [`FileSystem`] owns one composed store chain, the eviction task
//! sweeping its local cache, and the id stamped on every path it creates.
//! Operations take [`LogicalPath`]s; paths minted by another filesystem are
//! rejected, detached paths are accepted.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::config::{Config, StoreSettings};
use crate::eviction::{EvictionHandle, EvictionPolicy, start_eviction};
use crate::path::{FileSystemId, LogicalPath};
use crate::registry::Registry;
use crate::store::{
    CopyOptions, DirEntry, FileAttr, LocalStore, Store, StoreError, StoreReader, StoreResult,
    StoreWriter, SweepReport, WriteMode,
};

/// An open caching filesystem.
#[derive(Debug)]
pub struct FileSystem {
    id: FileSystemId,
    store: Arc<dyn Store>,
    local: Arc<LocalStore>,
    settings: StoreSettings,
    eviction: Mutex<Option<EvictionHandle>>,
    closed: AtomicBool,
}

impl FileSystem {
    /// Open a filesystem rooted at `base` using the built-in registry.
    ///
    /// `baseDirectory` in `config` overrides `base`. Must be called inside
    /// a tokio runtime when eviction is configured.
    pub async fn open(base: impl AsRef<Path>, config: &Config) -> StoreResult<Self> {
        Self::open_with_registry(&Registry::builtin(), base, config).await
    }

    pub async fn open_with_registry(
        registry: &Registry,
        base: impl AsRef<Path>,
        config: &Config,
    ) -> StoreResult<Self> {
        let settings = StoreSettings::from_config(config)?;
        let base = settings
            .base_directory
            .clone()
            .unwrap_or_else(|| base.as_ref().to_path_buf());

        let chain = registry.build(&base, config).await?;
        let eviction = EvictionPolicy::from_settings(&settings)
            .map(|policy| start_eviction(chain.local.clone(), policy));

        let fs = Self {
            id: FileSystemId::next(),
            store: chain.top,
            local: chain.local,
            settings,
            eviction: Mutex::new(eviction),
            closed: AtomicBool::new(false),
        };
        info!(
            base = %fs.base_directory().display(),
            layout = %fs.settings.layout,
            wrappers = ?fs.settings.wrappers,
            read_only = fs.settings.read_only,
            "opened filesystem"
        );
        Ok(fs)
    }

    pub fn id(&self) -> FileSystemId {
        self.id
    }

    /// Build a path owned by this filesystem.
    pub fn path(&self, raw: &str) -> StoreResult<LogicalPath> {
        LogicalPath::in_filesystem(self.id, raw)
    }

    /// The absolute root `/`.
    pub fn root(&self) -> LogicalPath {
        LogicalPath::root_of(self.id)
    }

    pub fn base_directory(&self) -> &Path {
        self.local.base_directory()
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn is_read_only(&self) -> bool {
        self.settings.read_only
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// The top of the store chain.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn check_owned(&self, path: &LogicalPath) -> StoreResult<()> {
        let owner = path.filesystem();
        if owner == self.id || owner == FileSystemId::DETACHED {
            Ok(())
        } else {
            Err(StoreError::invalid_argument(format!(
                "{path} belongs to another file system"
            )))
        }
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.settings.read_only {
            Err(StoreError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub async fn exists(&self, path: &LogicalPath) -> StoreResult<bool> {
        self.check_owned(path)?;
        self.store.exists(path).await
    }

    pub async fn create_dir(&self, path: &LogicalPath) -> StoreResult<()> {
        self.check_owned(path)?;
        self.check_writable()?;
        self.store.create_dir(path).await
    }

    pub async fn open_read(&self, path: &LogicalPath) -> StoreResult<StoreReader> {
        self.check_owned(path)?;
        self.store.open_read(path).await
    }

    pub async fn open_write(
        &self,
        path: &LogicalPath,
        mode: WriteMode,
    ) -> StoreResult<Box<dyn StoreWriter>> {
        self.check_owned(path)?;
        self.check_writable()?;
        self.store.open_write(path, mode).await
    }

    pub async fn read_all(&self, path: &LogicalPath) -> StoreResult<Vec<u8>> {
        self.check_owned(path)?;
        self.store.read_all(path).await
    }

    pub async fn write_all(&self, path: &LogicalPath, data: &[u8]) -> StoreResult<()> {
        self.check_owned(path)?;
        self.check_writable()?;
        self.store.write_all(path, data).await
    }

    pub async fn delete(&self, path: &LogicalPath, must_exist: bool) -> StoreResult<bool> {
        self.check_owned(path)?;
        self.check_writable()?;
        self.store.delete(path, must_exist).await
    }

    pub async fn stat(&self, path: &LogicalPath) -> StoreResult<FileAttr> {
        self.check_owned(path)?;
        self.store.stat(path).await
    }

    pub async fn size(&self, path: &LogicalPath) -> StoreResult<u64> {
        self.check_owned(path)?;
        self.store.size(path).await
    }

    pub async fn list(&self, path: &LogicalPath) -> StoreResult<Vec<DirEntry>> {
        self.check_owned(path)?;
        self.store.list(path).await
    }

    /// Copy within this filesystem.
    pub async fn copy(
        &self,
        from: &LogicalPath,
        to: &LogicalPath,
        opts: CopyOptions,
    ) -> StoreResult<()> {
        self.check_owned(from)?;
        self.check_owned(to)?;
        self.check_writable()?;
        self.store.copy(from, to, opts).await
    }

    /// Rename within this filesystem.
    pub async fn rename(
        &self,
        from: &LogicalPath,
        to: &LogicalPath,
        opts: CopyOptions,
    ) -> StoreResult<()> {
        self.check_owned(from)?;
        self.check_owned(to)?;
        self.check_writable()?;
        self.store.rename(from, to, opts).await
    }

    /// Copy `from` here to `to` in `target`, streaming when the
    /// filesystems differ.
    pub async fn copy_to(
        &self,
        from: &LogicalPath,
        target: &FileSystem,
        to: &LogicalPath,
        opts: CopyOptions,
    ) -> StoreResult<()> {
        if self.id == target.id {
            return self.copy(from, to, opts).await;
        }
        self.check_owned(from)?;
        target.check_owned(to)?;
        target.check_writable()?;

        let attr = self.store.stat(from).await?;
        if !opts.replace_existing && target.store.exists(to).await? {
            return Err(StoreError::already_exists(to.as_str()));
        }

        if attr.is_dir() {
            debug!(from = %from, to = %to, "cross file system directory copy");
            return target.store.create_dir(to).await;
        }

        debug!(from = %from, to = %to, bytes = attr.size, "cross file system copy");
        let mut reader = self.store.open_read(from).await?;
        let mut writer = target.store.open_write(to, WriteMode::Truncate).await?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| StoreError::io(from.as_str(), e))?;
            if n == 0 {
                break;
            }
            writer.write(&buf[..n]).await?;
        }
        writer.close().await
    }

    /// Move `from` here to `to` in `target`. Across filesystems this is a
    /// copy followed by deleting the source.
    pub async fn move_to(
        &self,
        from: &LogicalPath,
        target: &FileSystem,
        to: &LogicalPath,
        opts: CopyOptions,
    ) -> StoreResult<()> {
        if self.id == target.id {
            return self.rename(from, to, opts).await;
        }
        self.check_writable()?;
        self.copy_to(from, target, to, opts).await?;
        self.store.delete(from, true).await?;
        Ok(())
    }

    /// Run one eviction sweep now.
    pub async fn expire(&self, max_age: Duration) -> StoreResult<SweepReport> {
        self.store.expire(max_age).await
    }

    /// Stop eviction and close the store chain. Idempotent.
    pub async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let eviction = self.eviction.lock().take();
        if let Some(handle) = eviction {
            handle.shutdown().await;
        }
        self.store.close().await?;
        info!(base = %self.base_directory().display(), "closed filesystem");
        Ok(())
    }
}
