//! Background eviction against the wall clock.

use std::time::Duration;

use cachefs_core::config::{MAX_AGE, SCAN_DELAY};
use cachefs_core::{Config, FileSystem};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_stale_file_expires_in_background() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = Config::new().with(MAX_AGE, 3000).with(SCAN_DELAY, 1000);
    let fs = FileSystem::open(dir.path(), &config).await.unwrap();

    let path = fs.path("/tiles/0/0/0.png").unwrap();
    fs.write_all(&path, b"tile").await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(fs.exists(&path).await.unwrap(), "younger than maxAge");

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!fs.exists(&path).await.unwrap(), "older than maxAge");

    fs.close().await.unwrap();
}

#[tokio::test]
async fn test_no_sweeps_without_max_age() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(dir.path(), &Config::new().with(SCAN_DELAY, 200))
        .await
        .unwrap();

    let path = fs.path("/keep.txt").unwrap();
    fs.write_all(&path, b"kept").await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert!(fs.exists(&path).await.unwrap());
    fs.close().await.unwrap();
}
