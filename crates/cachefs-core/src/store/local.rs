//! Local disk store.
//!
//! Bytes live under a base directory at the location the store's
//! [`StorageMapper`] computes for each resolved key. Every mapped location
//! is confined lexically to the base; anything that would land outside it
//! is rejected with `PathEscapesRoot`.
//!
//! Truncating writes stream into a hidden staging file next to the target
//! and are renamed over it on close, so readers see either the old bytes
//! or the new ones.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::error::{StoreError, StoreResult};
use super::ops::{Store, StoreReader, StoreWriter};
use super::types::{CopyOptions, DirEntry, FileAttr, FileType, SweepReport, WriteMode};
use crate::eviction;
use crate::mapper::StorageMapper;
use crate::path::LogicalPath;

/// Prefix of staging file names. Entries carrying it are never listed.
const STAGING_PREFIX: &str = ".cachefs-";
const STAGING_SUFFIX: &str = ".part";

/// Lifecycle flags for a [`LocalStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalStoreOptions {
    /// Delete the whole tree when the store is closed or dropped.
    pub temporary: bool,
    /// Delete the whole tree when the store is opened.
    pub clear_on_startup: bool,
}

/// Local filesystem store.
///
/// All operations are confined to `base`. For example, with a flat layout
/// and `base` at `/var/cache/cachefs/example.org`, the logical path
/// `/img/a.png` lives at `/var/cache/cachefs/example.org/img/a.png`.
#[derive(Debug)]
pub struct LocalStore {
    base: PathBuf,
    mapper: Arc<dyn StorageMapper>,
    options: LocalStoreOptions,
    closed: AtomicBool,
}

impl LocalStore {
    /// Open a store rooted at `base`, creating the directory if needed.
    ///
    /// The base is canonicalized so that confinement checks compare like
    /// with like (e.g. macOS `/tmp` → `/private/tmp`).
    pub async fn open(
        base: impl Into<PathBuf>,
        mapper: Arc<dyn StorageMapper>,
        options: LocalStoreOptions,
    ) -> StoreResult<Self> {
        let base: PathBuf = base.into();
        let shown = base.display().to_string();

        if options.clear_on_startup && fs::try_exists(&base).await.unwrap_or(false) {
            info!(base = %shown, "clearing store on startup");
            fs::remove_dir_all(&base)
                .await
                .map_err(|e| StoreError::io(&shown, e))?;
        }

        fs::create_dir_all(&base)
            .await
            .map_err(|e| StoreError::io(&shown, e))?;
        let base = dunce::canonicalize(&base).map_err(|e| StoreError::io(&shown, e))?;

        debug!(
            base = %base.display(),
            layout = mapper.name(),
            temporary = options.temporary,
            "opened local store"
        );

        Ok(Self {
            base,
            mapper,
            options,
            closed: AtomicBool::new(false),
        })
    }

    /// The layout this store maps keys with.
    pub fn mapper(&self) -> &dyn StorageMapper {
        self.mapper.as_ref()
    }

    pub fn options(&self) -> LocalStoreOptions {
        self.options
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::closed(self.base.display().to_string()))
        } else {
            Ok(())
        }
    }

    /// Physical location of `path`.
    pub fn physical_path(&self, path: &LogicalPath) -> StoreResult<PathBuf> {
        let key = path.resolved_key();
        if key.is_empty() {
            return Ok(self.base.clone());
        }
        let mapped = self.mapper.map(key)?;
        confine(&self.base, &mapped).ok_or_else(|| {
            StoreError::path_escapes_root(format!(
                "{path} maps to {mapped}, outside {}",
                self.base.display()
            ))
        })
    }

    async fn metadata(&self, path: &LogicalPath) -> StoreResult<Option<std::fs::Metadata>> {
        let physical = self.physical_path(path)?;
        match fs::symlink_metadata(&physical).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path.as_str(), e)),
        }
    }

    async fn ensure_parent(&self, path: &LogicalPath, physical: &Path) -> StoreResult<()> {
        if let Some(parent) = physical.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(path.as_str(), e))?;
        }
        Ok(())
    }

    /// Fail if `to` exists and the caller did not ask to replace it.
    async fn check_target(&self, to: &LogicalPath, opts: CopyOptions) -> StoreResult<()> {
        if !opts.replace_existing && self.metadata(to).await?.is_some() {
            return Err(StoreError::already_exists(to.as_str()));
        }
        Ok(())
    }

    async fn remove_tree(&self) {
        match fs::remove_dir_all(&self.base).await {
            Ok(()) => info!(base = %self.base.display(), "removed temporary store"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(base = %self.base.display(), error = %e, "failed to remove temporary store"),
        }
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        if self.options.temporary && !self.closed.swap(true, Ordering::AcqRel) {
            let _ = std::fs::remove_dir_all(&self.base);
        }
    }
}

/// Join `relative` onto `base` without ever leaving it.
fn confine(base: &Path, relative: &str) -> Option<PathBuf> {
    let mut out = base.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir if depth > 0 => {
                out.pop();
                depth -= 1;
            }
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(
        "{STAGING_PREFIX}{}-{name}{STAGING_SUFFIX}",
        uuid::Uuid::new_v4().simple()
    ))
}

/// Whether a directory entry name is an in-flight staging file.
fn is_staging_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX) && name.ends_with(STAGING_SUFFIX)
}

#[async_trait]
impl Store for LocalStore {
    async fn exists(&self, path: &LogicalPath) -> StoreResult<bool> {
        self.check_open()?;
        Ok(self.metadata(path).await?.is_some())
    }

    async fn create_dir(&self, path: &LogicalPath) -> StoreResult<()> {
        self.check_open()?;
        if !self.mapper.supports_directories() {
            return Ok(());
        }
        let physical = self.physical_path(path)?;
        fs::create_dir_all(&physical)
            .await
            .map_err(|e| StoreError::io(path.as_str(), e))
    }

    async fn open_read(&self, path: &LogicalPath) -> StoreResult<StoreReader> {
        self.check_open()?;
        let meta = self
            .metadata(path)
            .await?
            .ok_or_else(|| StoreError::not_found(path.as_str()))?;
        if meta.is_dir() {
            return Err(StoreError::is_a_directory(path.as_str()));
        }
        let physical = self.physical_path(path)?;
        let file = fs::File::open(&physical)
            .await
            .map_err(|e| StoreError::io(path.as_str(), e))?;
        Ok(Box::new(file))
    }

    async fn open_write(
        &self,
        path: &LogicalPath,
        mode: WriteMode,
    ) -> StoreResult<Box<dyn StoreWriter>> {
        self.check_open()?;
        let target = self.physical_path(path)?;
        if target == self.base {
            return Err(StoreError::is_a_directory(path.as_str()));
        }
        if let Some(meta) = self.metadata(path).await?
            && meta.is_dir()
        {
            return Err(StoreError::is_a_directory(path.as_str()));
        }
        self.ensure_parent(path, &target).await?;

        let (file, staging) = match mode {
            WriteMode::Truncate => {
                let staging = staging_path(&target);
                let file = fs::File::create(&staging)
                    .await
                    .map_err(|e| StoreError::io(path.as_str(), e))?;
                (file, Some(staging))
            }
            WriteMode::Append => {
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&target)
                    .await
                    .map_err(|e| StoreError::io(path.as_str(), e))?;
                (file, None)
            }
            WriteMode::CreateNew => {
                let file = fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&target)
                    .await
                    .map_err(|e| StoreError::io(path.as_str(), e))?;
                (file, None)
            }
        };

        Ok(Box::new(LocalWriter {
            path: path.as_str().to_string(),
            target,
            staging,
            file: Some(file),
        }))
    }

    async fn delete(&self, path: &LogicalPath, must_exist: bool) -> StoreResult<bool> {
        self.check_open()?;
        if path.resolved_key().is_empty() {
            return Err(StoreError::invalid_argument("cannot delete the store root"));
        }
        let Some(meta) = self.metadata(path).await? else {
            return if must_exist {
                Err(StoreError::not_found(path.as_str()))
            } else {
                Ok(false)
            };
        };
        let physical = self.physical_path(path)?;
        let result = if meta.is_dir() {
            fs::remove_dir(&physical).await
        } else {
            fs::remove_file(&physical).await
        };
        result.map_err(|e| StoreError::io(path.as_str(), e))?;
        Ok(true)
    }

    async fn copy(
        &self,
        from: &LogicalPath,
        to: &LogicalPath,
        opts: CopyOptions,
    ) -> StoreResult<()> {
        self.check_open()?;
        let meta = self
            .metadata(from)
            .await?
            .ok_or_else(|| StoreError::not_found(from.as_str()))?;
        self.check_target(to, opts).await?;

        if meta.is_dir() {
            return self.create_dir(to).await;
        }

        let source = self.physical_path(from)?;
        let target = self.physical_path(to)?;
        self.ensure_parent(to, &target).await?;
        let staging = staging_path(&target);
        if let Err(e) = fs::copy(&source, &staging).await {
            let _ = fs::remove_file(&staging).await;
            return Err(StoreError::io(from.as_str(), e));
        }
        if let Err(e) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(StoreError::io(to.as_str(), e));
        }
        Ok(())
    }

    async fn rename(
        &self,
        from: &LogicalPath,
        to: &LogicalPath,
        opts: CopyOptions,
    ) -> StoreResult<()> {
        self.check_open()?;
        if self.metadata(from).await?.is_none() {
            return Err(StoreError::not_found(from.as_str()));
        }
        self.check_target(to, opts).await?;

        let source = self.physical_path(from)?;
        let target = self.physical_path(to)?;
        self.ensure_parent(to, &target).await?;
        fs::rename(&source, &target)
            .await
            .map_err(|e| StoreError::io(from.as_str(), e))
    }

    async fn stat(&self, path: &LogicalPath) -> StoreResult<FileAttr> {
        self.check_open()?;
        if path.resolved_key().is_empty() {
            return Ok(FileAttr::root());
        }
        let meta = self
            .metadata(path)
            .await?
            .ok_or_else(|| StoreError::not_found(path.as_str()))?;
        Ok(FileAttr::from_metadata(&meta))
    }

    async fn list(&self, path: &LogicalPath) -> StoreResult<Vec<DirEntry>> {
        self.check_open()?;
        // Digest-keyed entries have no browsable names.
        if !self.mapper.supports_directories() {
            return Ok(Vec::new());
        }
        let meta = self
            .metadata(path)
            .await?
            .ok_or_else(|| StoreError::not_found(path.as_str()))?;
        if !meta.is_dir() {
            return Err(StoreError::not_a_directory(path.as_str()));
        }

        let physical = self.physical_path(path)?;
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&physical)
            .await
            .map_err(|e| StoreError::io(path.as_str(), e))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StoreError::io(path.as_str(), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_staging_name(&name) {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StoreError::io(path.as_str(), e))?;
            let kind = if file_type.is_dir() {
                FileType::Directory
            } else if file_type.is_symlink() {
                FileType::Symlink
            } else {
                FileType::File
            };
            entries.push(DirEntry { name, kind });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn base_directory(&self) -> &Path {
        &self.base
    }

    async fn expire(&self, max_age: Duration) -> StoreResult<SweepReport> {
        self.check_open()?;
        eviction::sweep(self.base.clone(), max_age).await
    }

    async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.options.temporary {
            self.remove_tree().await;
        }
        Ok(())
    }
}

/// Writer for [`LocalStore`]. Truncating writes go through a staging file.
struct LocalWriter {
    path: String,
    target: PathBuf,
    staging: Option<PathBuf>,
    file: Option<fs::File>,
}

#[async_trait]
impl StoreWriter for LocalWriter {
    async fn write(&mut self, buf: &[u8]) -> StoreResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::closed(self.path.clone()))?;
        file.write_all(buf)
            .await
            .map_err(|e| StoreError::io(&self.path, e))
    }

    async fn close(&mut self) -> StoreResult<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush()
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        drop(file);

        if let Some(staging) = self.staging.take()
            && let Err(e) = fs::rename(&staging, &self.target).await
        {
            let _ = fs::remove_file(&staging).await;
            return Err(StoreError::io(&self.path, e));
        }
        Ok(())
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        // Abandoned before close: the target keeps its previous contents.
        if let Some(staging) = self.staging.take() {
            let _ = std::fs::remove_file(staging);
        }
    }
}
