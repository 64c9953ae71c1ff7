//! Age-based eviction.
//!
//! [`sweep`] walks a store's tree once and deletes everything older than
//! the cutoff. Directories are recursed first and removed only when every
//! child went and the directory itself is old, so a directory holding live
//! files always survives.
//!
//! [`start_eviction`] drives sweeps in the background according to an
//! [`EvictionPolicy`] and returns a handle that stops them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StoreSettings;
use crate::store::{Store, StoreError, StoreResult, SweepReport};

/// Delay before the first sweep when expiring on startup.
pub const STARTUP_DELAY: Duration = Duration::from_secs(1);

/// Walk `base` once, deleting entries last modified more than `max_age` ago.
///
/// The base directory itself is never removed. Failed deletions are logged
/// and counted, never propagated.
pub async fn sweep(base: PathBuf, max_age: Duration) -> StoreResult<SweepReport> {
    tokio::task::spawn_blocking(move || {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut report = SweepReport::default();
        sweep_children(&base, cutoff, &mut report);
        report
    })
    .await
    .map_err(|e| StoreError::other(format!("sweep task failed: {e}")))
}

/// Expire every child of `dir`. Returns true if all of them were deleted.
fn sweep_children(dir: &Path, cutoff: SystemTime, report: &mut SweepReport) -> bool {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "sweep could not read directory");
            report.failures += 1;
            return false;
        }
    };

    let mut all_deleted = true;
    for entry in entries {
        match entry {
            Ok(entry) => all_deleted &= expire_entry(&entry.path(), cutoff, report),
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "sweep could not read entry");
                report.failures += 1;
                all_deleted = false;
            }
        }
    }
    all_deleted
}

/// Expire one entry. Returns true if it no longer exists.
fn expire_entry(path: &Path, cutoff: SystemTime, report: &mut SweepReport) -> bool {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "sweep could not stat entry");
            report.failures += 1;
            return false;
        }
    };
    // Taken before recursion: deleting children touches the directory.
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    if meta.is_dir() {
        let emptied = sweep_children(path, cutoff, report);
        if !emptied || modified >= cutoff {
            return false;
        }
        match std::fs::remove_dir(path) {
            Ok(()) => {
                report.dirs_deleted += 1;
                true
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "sweep failed to remove directory");
                report.failures += 1;
                false
            }
        }
    } else {
        if modified >= cutoff {
            return false;
        }
        match std::fs::remove_file(path) {
            Ok(()) => {
                report.files_deleted += 1;
                report.bytes_freed += meta.len();
                true
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "sweep failed to remove file");
                report.failures += 1;
                false
            }
        }
    }
}

/// When sweeps run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionSchedule {
    /// A single sweep after `delay`.
    Once { delay: Duration },
    /// A sweep after `initial_delay`, then every `period`.
    Periodic {
        initial_delay: Duration,
        period: Duration,
    },
}

/// Age limit plus schedule for one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub max_age: Duration,
    pub schedule: EvictionSchedule,
}

impl EvictionPolicy {
    /// Derive the policy from store settings; `None` means no sweeps.
    ///
    /// A positive scan delay sweeps periodically, starting after
    /// [`STARTUP_DELAY`] when expiring on startup without clearing and
    /// after one period otherwise. A non-positive scan delay sweeps once
    /// after startup, and only when expiring on startup without clearing.
    pub fn from_settings(settings: &StoreSettings) -> Option<Self> {
        let max_age = settings.max_age?;
        let startup_sweep = settings.expire_on_startup && !settings.clear_on_startup;

        let schedule = match settings.scan_delay {
            Some(period) => EvictionSchedule::Periodic {
                initial_delay: if startup_sweep { STARTUP_DELAY } else { period },
                period,
            },
            None if startup_sweep => EvictionSchedule::Once {
                delay: STARTUP_DELAY,
            },
            None => return None,
        };
        Some(Self { max_age, schedule })
    }
}

/// Running eviction task. Dropping the handle stops it.
#[derive(Debug)]
pub struct EvictionHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EvictionHandle {
    /// Stop scheduling sweeps. A sweep already walking the tree finishes.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for EvictionHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawn the sweep task for `store`.
pub fn start_eviction(store: Arc<dyn Store>, policy: EvictionPolicy) -> EvictionHandle {
    let token = CancellationToken::new();
    let shutdown = token.clone();

    info!(
        base = %store.base_directory().display(),
        max_age_ms = policy.max_age.as_millis() as u64,
        schedule = ?policy.schedule,
        "starting eviction"
    );

    let task = tokio::spawn(async move {
        match policy.schedule {
            EvictionSchedule::Once { delay } => {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                run_sweep(store.as_ref(), policy.max_age).await;
            }
            EvictionSchedule::Periodic {
                initial_delay,
                period,
            } => {
                let mut interval = tokio::time::interval_at(Instant::now() + initial_delay, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => run_sweep(store.as_ref(), policy.max_age).await,
                    }
                }
            }
        }
        debug!(base = %store.base_directory().display(), "eviction stopped");
    });

    EvictionHandle {
        token,
        task: Some(task),
    }
}

async fn run_sweep(store: &dyn Store, max_age: Duration) {
    let started = std::time::Instant::now();
    match store.expire(max_age).await {
        Ok(report) => {
            if report.files_deleted + report.dirs_deleted > 0 {
                info!(
                    base = %store.base_directory().display(),
                    files = report.files_deleted,
                    dirs = report.dirs_deleted,
                    bytes = report.bytes_freed,
                    failures = report.failures,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sweep complete"
                );
            } else {
                debug!(
                    base = %store.base_directory().display(),
                    failures = report.failures,
                    "sweep found nothing to expire"
                );
            }
        }
        Err(e) => warn!(
            base = %store.base_directory().display(),
            error = %e,
            "sweep failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File, FileTimes};
    use tempfile::TempDir;

    fn backdate(path: &Path, age: Duration) {
        let when = SystemTime::now() - age;
        let times = FileTimes::new().set_modified(when).set_accessed(when);
        if path.is_dir() {
            File::open(path).unwrap().set_times(times).unwrap();
        } else {
            fs::OpenOptions::new()
                .write(true)
                .open(path)
                .unwrap()
                .set_times(times)
                .unwrap();
        }
    }

    fn settings(max_age_ms: u64, scan_delay_ms: Option<u64>) -> StoreSettings {
        StoreSettings {
            max_age: Some(Duration::from_millis(max_age_ms)),
            scan_delay: scan_delay_ms.map(Duration::from_millis),
            ..StoreSettings::default()
        }
    }

    #[tokio::test]
    async fn test_sweep_deletes_old_files_only() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old.bin");
        let fresh = dir.path().join("fresh.bin");
        fs::write(&old, b"0123456789").unwrap();
        fs::write(&fresh, b"x").unwrap();
        backdate(&old, Duration::from_secs(3600));

        let report = sweep(dir.path().to_path_buf(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(!old.exists());
        assert!(fresh.exists());
        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.bytes_freed, 10);
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_sweep_keeps_non_empty_directories() {
        let dir = TempDir::new().unwrap();
        let keep = dir.path().join("keep");
        let drop_dir = dir.path().join("drop");
        fs::create_dir_all(&keep).unwrap();
        fs::create_dir_all(drop_dir.join("inner")).unwrap();
        fs::write(keep.join("live"), b"x").unwrap();
        fs::write(keep.join("stale"), b"x").unwrap();
        fs::write(drop_dir.join("inner/stale"), b"x").unwrap();

        backdate(&keep.join("stale"), Duration::from_secs(3600));
        backdate(&drop_dir.join("inner/stale"), Duration::from_secs(3600));
        backdate(&drop_dir.join("inner"), Duration::from_secs(3600));
        backdate(&drop_dir, Duration::from_secs(3600));
        backdate(&keep, Duration::from_secs(3600));

        let report = sweep(dir.path().to_path_buf(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(keep.join("live").exists());
        assert!(!keep.join("stale").exists());
        assert!(keep.exists());
        assert!(!drop_dir.exists());
        assert_eq!(report.files_deleted, 2);
        assert_eq!(report.dirs_deleted, 2);
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_empty_directory() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();

        sweep(dir.path().to_path_buf(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(empty.exists());
    }

    #[test]
    fn test_policy_disabled_without_max_age() {
        assert_eq!(EvictionPolicy::from_settings(&StoreSettings::default()), None);
    }

    #[test]
    fn test_policy_periodic_with_startup_sweep() {
        let policy = EvictionPolicy::from_settings(&settings(3000, Some(1000))).unwrap();
        assert_eq!(policy.max_age, Duration::from_millis(3000));
        assert_eq!(
            policy.schedule,
            EvictionSchedule::Periodic {
                initial_delay: STARTUP_DELAY,
                period: Duration::from_millis(1000),
            }
        );
    }

    #[test]
    fn test_policy_periodic_after_clear_waits_one_period() {
        let mut s = settings(3000, Some(5000));
        s.clear_on_startup = true;
        let policy = EvictionPolicy::from_settings(&s).unwrap();
        assert_eq!(
            policy.schedule,
            EvictionSchedule::Periodic {
                initial_delay: Duration::from_millis(5000),
                period: Duration::from_millis(5000),
            }
        );
    }

    #[test]
    fn test_policy_once_when_period_disabled() {
        let policy = EvictionPolicy::from_settings(&settings(3000, None)).unwrap();
        assert_eq!(
            policy.schedule,
            EvictionSchedule::Once {
                delay: STARTUP_DELAY
            }
        );

        let mut s = settings(3000, None);
        s.expire_on_startup = false;
        assert_eq!(EvictionPolicy::from_settings(&s), None);
    }

    #[tokio::test]
    async fn test_handle_cancel_stops_task() {
        use crate::mapper::FlatMapper;
        use crate::store::{LocalStore, LocalStoreOptions};

        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path(), Arc::new(FlatMapper), LocalStoreOptions::default())
            .await
            .unwrap();
        let policy = EvictionPolicy {
            max_age: Duration::from_millis(1),
            schedule: EvictionSchedule::Periodic {
                initial_delay: Duration::from_secs(3600),
                period: Duration::from_secs(3600),
            },
        };

        let handle = start_eviction(Arc::new(store), policy);
        handle.cancel();
        assert!(handle.is_cancelled());
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("eviction task should exit promptly");
    }
}
