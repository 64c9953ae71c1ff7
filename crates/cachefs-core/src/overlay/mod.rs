//! Overlay engine: read-through fetch and write-through push.
//!
//! An [`Overlay`] decorates the next store in a chain. Reads of paths the
//! next store lacks are filled by the [`Retriever`] first; writes are
//! pushed by the [`Sender`] once the local write closes. Everything else
//! is delegated untouched, including shutdown.
//!
//! With a [`PathSynchronizer`] attached, fetches and pushes for the same
//! key never overlap, and a reader that waited on someone else's fetch
//! re-checks the local copy instead of fetching again.

mod remote;

pub use remote::{Retriever, Sender, copy_from_remote};

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::path::LogicalPath;
use crate::store::{
    CopyOptions, DirEntry, FileAttr, Store, StoreReader, StoreResult, StoreWriter, SweepReport,
    WriteMode,
};
use crate::sync::{PathSynchronizer, Synchronized};

/// Store decorator adding a remote origin.
#[derive(Debug)]
pub struct Overlay {
    next: Arc<dyn Store>,
    retriever: Option<Arc<dyn Retriever>>,
    sender: Option<Arc<dyn Sender>>,
    synchronizer: Option<Arc<PathSynchronizer>>,
}

impl Overlay {
    /// Wrap `next` with no origin attached; add one with the builders.
    pub fn new(next: Arc<dyn Store>) -> Self {
        Self {
            next,
            retriever: None,
            sender: None,
            synchronizer: None,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_sender(mut self, sender: Arc<dyn Sender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_synchronizer(mut self, synchronizer: Arc<PathSynchronizer>) -> Self {
        self.synchronizer = Some(synchronizer);
        self
    }

    /// The store this overlay delegates to.
    pub fn next(&self) -> &Arc<dyn Store> {
        &self.next
    }

    /// Make sure `path` has a local copy, fetching it if needed.
    async fn ensure_local(&self, path: &LogicalPath) -> StoreResult<()> {
        let Some(retriever) = &self.retriever else {
            return Ok(());
        };
        if path.resolved_key().is_empty() {
            return Ok(());
        }

        loop {
            if self.next.exists(path).await? {
                return Ok(());
            }

            let Some(sync) = &self.synchronizer else {
                return self.fetch(retriever.as_ref(), path).await;
            };
            let outcome = sync
                .execute(path.resolved_key(), || {
                    self.fetch_if_missing(retriever.as_ref(), path)
                })
                .await?;
            match outcome {
                Synchronized::Ran(()) => return Ok(()),
                // Someone else fetched (or failed to); look again.
                Synchronized::Waited => continue,
            }
        }
    }

    async fn fetch_if_missing(&self, retriever: &dyn Retriever, path: &LogicalPath) -> StoreResult<()> {
        if self.next.exists(path).await? {
            return Ok(());
        }
        self.fetch(retriever, path).await
    }

    async fn fetch(&self, retriever: &dyn Retriever, path: &LogicalPath) -> StoreResult<()> {
        debug!(path = %path, "cache miss, retrieving from origin");
        retriever.retrieve(path, self.next.as_ref()).await?;
        debug!(path = %path, "retrieved from origin");
        Ok(())
    }
}

#[async_trait]
impl Store for Overlay {
    async fn exists(&self, path: &LogicalPath) -> StoreResult<bool> {
        self.next.exists(path).await
    }

    async fn create_dir(&self, path: &LogicalPath) -> StoreResult<()> {
        self.next.create_dir(path).await
    }

    async fn open_read(&self, path: &LogicalPath) -> StoreResult<StoreReader> {
        self.ensure_local(path).await?;
        match self.next.open_read(path).await {
            // Swept between the existence check and the open.
            Err(e) if e.is_not_found() && self.retriever.is_some() => {
                debug!(path = %path, "local copy vanished, retrieving again");
                self.ensure_local(path).await?;
                self.next.open_read(path).await
            }
            other => other,
        }
    }

    async fn open_write(
        &self,
        path: &LogicalPath,
        mode: WriteMode,
    ) -> StoreResult<Box<dyn StoreWriter>> {
        let inner = self.next.open_write(path, mode).await?;
        let Some(sender) = &self.sender else {
            return Ok(inner);
        };
        Ok(Box::new(OverlayWriter {
            inner,
            path: path.clone(),
            next: self.next.clone(),
            sender: sender.clone(),
            synchronizer: self.synchronizer.clone(),
            closed: false,
        }))
    }

    async fn delete(&self, path: &LogicalPath, must_exist: bool) -> StoreResult<bool> {
        self.next.delete(path, must_exist).await
    }

    async fn copy(
        &self,
        from: &LogicalPath,
        to: &LogicalPath,
        opts: CopyOptions,
    ) -> StoreResult<()> {
        self.ensure_local(from).await?;
        self.next.copy(from, to, opts).await
    }

    async fn rename(
        &self,
        from: &LogicalPath,
        to: &LogicalPath,
        opts: CopyOptions,
    ) -> StoreResult<()> {
        self.ensure_local(from).await?;
        self.next.rename(from, to, opts).await
    }

    async fn stat(&self, path: &LogicalPath) -> StoreResult<FileAttr> {
        self.ensure_local(path).await?;
        self.next.stat(path).await
    }

    async fn list(&self, path: &LogicalPath) -> StoreResult<Vec<DirEntry>> {
        self.next.list(path).await
    }

    fn base_directory(&self) -> &Path {
        self.next.base_directory()
    }

    async fn expire(&self, max_age: Duration) -> StoreResult<SweepReport> {
        self.next.expire(max_age).await
    }

    async fn close(&self) -> StoreResult<()> {
        if let Some(sync) = &self.synchronizer {
            sync.shutdown();
        }
        self.next.close().await
    }
}

/// Write handle that pushes to the origin once the local write closes.
struct OverlayWriter {
    inner: Box<dyn StoreWriter>,
    path: LogicalPath,
    next: Arc<dyn Store>,
    sender: Arc<dyn Sender>,
    synchronizer: Option<Arc<PathSynchronizer>>,
    closed: bool,
}

impl OverlayWriter {
    /// Publish locally and push, as one operation on the path's key so a
    /// concurrent fetch cannot land between the two.
    async fn publish(&mut self) -> StoreResult<()> {
        let (sender, next, path) = (&self.sender, &self.next, &self.path);
        let inner = &mut self.inner;
        let Some(sync) = &self.synchronizer else {
            inner.close().await?;
            debug!(path = %path, "pushing to origin");
            return sender.send(path, next.as_ref()).await;
        };
        loop {
            let inner = &mut *inner;
            let outcome = sync
                .execute(path.resolved_key(), move || async move {
                    inner.close().await?;
                    debug!(path = %path, "pushing to origin");
                    sender.send(path, next.as_ref()).await
                })
                .await?;
            if let Synchronized::Ran(()) = outcome {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl StoreWriter for OverlayWriter {
    async fn write(&mut self, buf: &[u8]) -> StoreResult<()> {
        self.inner.write(buf).await
    }

    async fn close(&mut self) -> StoreResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.publish().await
    }
}
