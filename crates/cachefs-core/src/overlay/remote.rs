//! Remote origin contracts.
//!
//! Origins plug into an [`Overlay`](super::Overlay) through two narrow
//! traits. Neither knows about caching or synchronization; both receive the
//! store directly beneath the overlay and move bytes in or out of it.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::path::LogicalPath;
use crate::store::{Store, StoreError, StoreResult, WriteMode};

const COPY_BUFFER: usize = 64 * 1024;

/// Pulls bytes for a path from a remote origin into a store.
#[async_trait]
pub trait Retriever: Send + Sync + std::fmt::Debug {
    /// Write the origin's bytes for `path` into `store` with truncate
    /// semantics. Absence at the origin is `StoreError::NotFound`.
    async fn retrieve(&self, path: &LogicalPath, store: &dyn Store) -> StoreResult<()>;
}

/// Pushes a store's current bytes for a path to a remote origin.
#[async_trait]
pub trait Sender: Send + Sync + std::fmt::Debug {
    async fn send(&self, path: &LogicalPath, store: &dyn Store) -> StoreResult<()>;
}

/// Stream a remote body into `store` at `path`, replacing existing bytes.
///
/// Returns the number of bytes copied. A body that fails midway leaves the
/// previous contents in place.
pub async fn copy_from_remote<R>(
    mut body: R,
    store: &dyn Store,
    path: &LogicalPath,
) -> StoreResult<u64>
where
    R: AsyncRead + Unpin + Send,
{
    let mut writer = store.open_write(path, WriteMode::Truncate).await?;
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = body
            .read(&mut buf)
            .await
            .map_err(|e| StoreError::remote(path.as_str(), e.to_string()))?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n]).await?;
        total += n as u64;
    }
    writer.close().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::FlatMapper;
    use crate::store::{LocalStore, LocalStoreOptions};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_copy_from_remote_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path(), Arc::new(FlatMapper), LocalStoreOptions::default())
            .await
            .unwrap();
        let path = LogicalPath::new("/remote/file.bin").unwrap();
        store.write_all(&path, b"stale and longer").await.unwrap();

        let body: &[u8] = b"fresh";
        let copied = copy_from_remote(body, &store, &path).await.unwrap();

        assert_eq!(copied, 5);
        assert_eq!(store.read_all(&path).await.unwrap(), b"fresh");
    }
}
