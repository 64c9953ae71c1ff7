//! End-to-end flows through the provider with the built-in mirror origin.
//!
//! Each test builds a cache root and an origin directory in tempdirs and
//! goes through `FileSystemProvider::open`, so URI parsing, config
//! layering, registry composition and the overlay all run together.

use cachefs_core::config::{
    DELETE_ON_EXIT, FILE_SYSTEM_TYPE, FILE_SYSTEM_WRAPPER, REMOTE_DIRECTORY,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cachefs_core::{
    Config, CopyOptions, DirectoryOrigin, FileSystemProvider, LogicalPath, Overlay, Registry,
    Retriever, Store, StoreError, StoreResult, WrapperContext,
};
use tempfile::TempDir;

/// Directory origin that counts retrievals and answers slowly, so that
/// concurrent misses overlap.
#[derive(Debug)]
struct CountingOrigin {
    inner: DirectoryOrigin,
    retrievals: Arc<AtomicUsize>,
}

#[async_trait]
impl Retriever for CountingOrigin {
    async fn retrieve(&self, path: &LogicalPath, store: &dyn Store) -> StoreResult<()> {
        self.retrievals.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.inner.retrieve(path, store).await
    }
}

fn mirror_provider(cache: &TempDir, origin: &TempDir) -> FileSystemProvider {
    FileSystemProvider::new(cache.path()).with_defaults(
        Config::new()
            .with(FILE_SYSTEM_WRAPPER, "mirror")
            .with(REMOTE_DIRECTORY, origin.path().display()),
    )
}

#[tokio::test]
async fn test_read_through_then_served_locally() {
    let (cache, origin) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    std::fs::create_dir_all(origin.path().join("img")).unwrap();
    std::fs::write(origin.path().join("img/a.png"), b"first fetch").unwrap();
    let provider = mirror_provider(&cache, &origin);

    let (fs, path) = provider.open("cache://example.org/img/a.png").await.unwrap();
    assert_eq!(fs.read_all(&path).await.unwrap(), b"first fetch");

    // origin gone, the local copy still answers
    std::fs::remove_file(origin.path().join("img/a.png")).unwrap();
    assert_eq!(fs.read_all(&path).await.unwrap(), b"first fetch");
    assert_eq!(fs.size(&path).await.unwrap(), 11);

    provider.close_all().await.unwrap();
}

#[tokio::test]
async fn test_missing_everywhere_is_not_found() {
    let (cache, origin) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let provider = mirror_provider(&cache, &origin);

    let (fs, path) = provider.open("cache://example.org/nope.txt").await.unwrap();
    let err = fs.read_all(&path).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(fs.stat(&path).await.unwrap_err().is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_share_one_fetch() {
    let (cache, origin) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let body = vec![7u8; 256 * 1024];
    std::fs::write(origin.path().join("big.bin"), &body).unwrap();
    let retrievals = Arc::new(AtomicUsize::new(0));
    let counter = retrievals.clone();
    let root = origin.path().to_path_buf();
    let registry = Registry::builder()
        .wrapper(
            "counting",
            Arc::new(
                move |next: Arc<dyn Store>, ctx: &WrapperContext| -> StoreResult<Arc<dyn Store>> {
                    let origin = Arc::new(CountingOrigin {
                        inner: DirectoryOrigin::new(root.clone()),
                        retrievals: counter.clone(),
                    });
                    Ok(Arc::new(
                        Overlay::new(next)
                            .with_retriever(origin)
                            .with_synchronizer(ctx.synchronizer()),
                    ))
                },
            ),
        )
        .build();
    let provider = FileSystemProvider::new(cache.path())
        .with_registry(Arc::new(registry))
        .with_defaults(Config::new().with(FILE_SYSTEM_WRAPPER, "counting"));
    let (fs, path) = provider.open("cache://example.org/big.bin").await.unwrap();

    let mut readers = Vec::new();
    for _ in 0..8 {
        let (fs, path) = (fs.clone(), path.clone());
        readers.push(tokio::spawn(async move { fs.read_all(&path).await }));
    }
    for reader in readers {
        assert_eq!(reader.await.unwrap().unwrap(), body);
    }
    assert_eq!(retrievals.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_write_through_reaches_origin() {
    let (cache, origin) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let provider = mirror_provider(&cache, &origin);

    let (fs, path) = provider
        .open("cache://example.org/uploads/new%20file.txt")
        .await
        .unwrap();
    assert_eq!(path.as_str(), "/uploads/new file.txt");

    fs.write_all(&path, b"pushed").await.unwrap();

    assert_eq!(
        std::fs::read(origin.path().join("uploads/new file.txt")).unwrap(),
        b"pushed"
    );
    assert_eq!(fs.read_all(&path).await.unwrap(), b"pushed");
}

#[tokio::test]
async fn test_copy_between_authorities() {
    let (cache, origin) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    std::fs::write(origin.path().join("doc.txt"), b"shared").unwrap();
    let provider = mirror_provider(&cache, &origin);

    let (mirrored, src) = provider.open("cache://mirrored.example/doc.txt").await.unwrap();
    let (plain, dst) = provider
        .open("cache://plain.example/doc.txt?fileSystemWrapper=")
        .await
        .unwrap();

    mirrored
        .copy_to(&src, &plain, &dst, CopyOptions::default())
        .await
        .unwrap();
    assert_eq!(plain.read_all(&dst).await.unwrap(), b"shared");

    let err = mirrored
        .copy_to(&src, &plain, &dst, CopyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_unknown_wrapper_or_layout_fails_fast() {
    let cache = TempDir::new().unwrap();
    let provider = FileSystemProvider::new(cache.path());

    let err = provider
        .open(&format!("cache://a.example/x?{FILE_SYSTEM_WRAPPER}=nonesuch"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Config(_)));

    let err = provider
        .open(&format!("cache://b.example/x?{FILE_SYSTEM_TYPE}=nonesuch"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Config(_)));

    assert!(!cache.path().join("a.example").exists());
    assert!(!cache.path().join("b.example").exists());
}

#[tokio::test]
async fn test_temporary_store_removed_on_close() {
    let cache = TempDir::new().unwrap();
    let provider = FileSystemProvider::new(cache.path())
        .with_defaults(Config::new().with(DELETE_ON_EXIT, "true"));

    let (fs, path) = provider.open("cache://scratch.example/tmp.bin").await.unwrap();
    fs.write_all(&path, b"scratch").await.unwrap();
    let base = fs.base_directory().to_path_buf();
    assert!(base.exists());

    assert!(provider.close("scratch.example").await.unwrap());
    assert!(!base.exists());
}
