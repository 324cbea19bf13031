//! Age and size quotas over persisted frames, archives and logs.
//!
//! Files referenced by an in-flight alert are pinned through the
//! [`PinRegistry`] and skipped until a later sweep.

use crate::config::StorageConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reference-counted set of paths the reaper must not delete.
#[derive(Debug, Clone, Default)]
pub struct PinRegistry {
    pins: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl PinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a path until a matching [`unpin`](Self::unpin).
    pub fn pin(&self, path: impl Into<PathBuf>) {
        *self.pins.lock().entry(path.into()).or_insert(0) += 1;
    }

    pub fn unpin(&self, path: &Path) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                pins.remove(path);
            }
        }
    }

    pub fn is_pinned(&self, path: &Path) -> bool {
        self.pins.lock().contains_key(path)
    }

    /// Number of distinct pinned paths.
    pub fn len(&self) -> usize {
        self.pins.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.lock().is_empty()
    }

    /// Pin `paths` for as long as the returned lease lives.
    pub fn lease<I, P>(&self, paths: I) -> PinLease
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut lease = PinLease {
            registry: self.clone(),
            paths: Vec::new(),
        };
        for path in paths {
            lease.add(path);
        }
        lease
    }
}

/// Pins released on drop.
#[derive(Debug)]
pub struct PinLease {
    registry: PinRegistry,
    paths: Vec<PathBuf>,
}

impl PinLease {
    pub fn add(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.registry.pin(path.clone());
        self.paths.push(path);
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for PinLease {
    fn drop(&mut self) {
        for path in &self.paths {
            self.registry.unpin(path);
        }
    }
}

/// Sweep parameters.
#[derive(Debug, Clone)]
pub struct ReaperSettings {
    pub roots: Vec<PathBuf>,
    pub max_age: Duration,
    pub quota_bytes: u64,
    pub dry_run: bool,
    pub prune_empty_dirs: bool,
}

impl ReaperSettings {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            roots: vec![config.captures_dir.clone(), config.logs_dir.clone()],
            max_age: config.max_age(),
            quota_bytes: config.quota_bytes(),
            dry_run: config.dry_run,
            prune_empty_dirs: config.prune_empty_dirs,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub scanned: usize,
    pub deleted_by_age: usize,
    pub deleted_by_quota: usize,
    pub bytes_reclaimed: u64,
    pub skipped_pinned: usize,
    pub failures: usize,
    pub remaining_bytes: u64,
    pub dry_run: bool,
}

impl ReclaimReport {
    pub fn deleted(&self) -> usize {
        self.deleted_by_age + self.deleted_by_quota
    }
}

#[derive(Debug)]
struct Artifact {
    path: PathBuf,
    /// Resolved path, identical for the same file reached through two roots
    canonical: PathBuf,
    size: u64,
    modified: SystemTime,
    removed: bool,
    pinned: bool,
}

#[derive(Clone, Copy)]
enum Reason {
    Age,
    Quota,
}

/// Deletes persisted artifacts that are too old or push usage over quota.
///
/// Sweeps use blocking filesystem calls; run them off the async workers.
pub struct StorageReaper {
    settings: ReaperSettings,
    pins: PinRegistry,
}

impl StorageReaper {
    pub fn new(settings: ReaperSettings, pins: PinRegistry) -> Self {
        Self { settings, pins }
    }

    pub fn settings(&self) -> &ReaperSettings {
        &self.settings
    }

    pub fn sweep(&self) -> ReclaimReport {
        self.sweep_at(SystemTime::now())
    }

    /// Sweep as if the current time were `now`.
    pub fn sweep_at(&self, now: SystemTime) -> ReclaimReport {
        let mut report = ReclaimReport {
            dry_run: self.settings.dry_run,
            ..ReclaimReport::default()
        };

        let mut artifacts = Vec::new();
        for root in &self.settings.roots {
            collect_files(root, &mut artifacts, &mut report);
        }

        let mut seen = HashSet::new();
        artifacts.retain(|a| seen.insert(a.canonical.clone()));
        artifacts.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

        report.scanned = artifacts.len();
        let mut total: u64 = artifacts.iter().map(|a| a.size).sum();

        for artifact in artifacts.iter_mut() {
            let age = now.duration_since(artifact.modified).unwrap_or_default();
            if age <= self.settings.max_age {
                continue;
            }
            if self.remove(artifact, Reason::Age, &mut report) {
                total -= artifact.size;
            }
        }

        for artifact in artifacts.iter_mut() {
            if total <= self.settings.quota_bytes {
                break;
            }
            if artifact.removed {
                continue;
            }
            if self.remove(artifact, Reason::Quota, &mut report) {
                total -= artifact.size;
            }
        }

        if total > self.settings.quota_bytes {
            warn!(
                remaining_bytes = total,
                quota_bytes = self.settings.quota_bytes,
                skipped_pinned = report.skipped_pinned,
                "Storage still over quota after sweep"
            );
        }

        if self.settings.prune_empty_dirs && !self.settings.dry_run {
            for root in &self.settings.roots {
                prune_empty_dirs(root, &self.settings.roots);
            }
        }

        report.remaining_bytes = total;

        info!(
            scanned = report.scanned,
            deleted_by_age = report.deleted_by_age,
            deleted_by_quota = report.deleted_by_quota,
            bytes_reclaimed = report.bytes_reclaimed,
            skipped_pinned = report.skipped_pinned,
            failures = report.failures,
            remaining_bytes = report.remaining_bytes,
            dry_run = report.dry_run,
            "Storage sweep completed"
        );

        report
    }

    /// Returns true if the artifact is gone (or would be, in a dry run).
    fn remove(&self, artifact: &mut Artifact, reason: Reason, report: &mut ReclaimReport) -> bool {
        if self.pins.is_pinned(&artifact.path) || self.pins.is_pinned(&artifact.canonical) {
            if !artifact.pinned {
                artifact.pinned = true;
                report.skipped_pinned += 1;
                debug!(path = %artifact.path.display(), "Skipping pinned artifact");
            }
            return false;
        }

        if self.settings.dry_run {
            info!(path = %artifact.path.display(), size = artifact.size, "Would delete artifact");
        } else if let Err(e) = std::fs::remove_file(&artifact.path) {
            if e.kind() == std::io::ErrorKind::NotFound {
                // Already gone; it no longer counts against the quota
                artifact.removed = true;
                return true;
            }
            report.failures += 1;
            warn!(path = %artifact.path.display(), error = %e, "Failed to delete artifact");
            return false;
        } else {
            debug!(path = %artifact.path.display(), size = artifact.size, "Deleted artifact");
        }

        artifact.removed = true;
        report.bytes_reclaimed += artifact.size;
        match reason {
            Reason::Age => report.deleted_by_age += 1,
            Reason::Quota => report.deleted_by_quota += 1,
        }
        true
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = interval.as_secs(),
            quota_bytes = self.settings.quota_bytes,
            max_age_secs = self.settings.max_age.as_secs(),
            "Storage reaper started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reaper = self.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || reaper.sweep()).await {
                        warn!(error = %e, "Storage sweep task failed");
                    }
                }
            }
        }

        info!("Storage reaper stopped");
    }
}

fn collect_files(dir: &Path, out: &mut Vec<Artifact>, report: &mut ReclaimReport) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            report.failures += 1;
            warn!(dir = %dir.display(), error = %e, "Failed to list directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let metadata = match std::fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                report.failures += 1;
                warn!(path = %path.display(), error = %e, "Failed to stat artifact");
                continue;
            }
        };

        if metadata.is_dir() {
            collect_files(&path, out, report);
        } else if metadata.is_file() {
            let canonical = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
            out.push(Artifact {
                canonical,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                path,
                removed: false,
                pinned: false,
            });
        }
    }
}

/// Remove empty sub-directories below `dir`, keeping the sweep roots
/// themselves. Returns true if `dir` is empty afterwards.
fn prune_empty_dirs(dir: &Path, roots: &[PathBuf]) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };

    let mut empty = true;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !(is_dir && prune_empty_dirs(&path, roots)) {
            empty = false;
        }
    }

    if empty && !roots.iter().any(|root| root == dir) {
        match std::fs::remove_dir(dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), "Removed empty directory");
                return true;
            }
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Failed to remove directory");
                return false;
            }
        }
    }
    empty
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn write_file(path: &Path, size: usize, modified: SystemTime) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, vec![0u8; size]).unwrap();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    fn settings(root: &Path, quota_bytes: u64) -> ReaperSettings {
        ReaperSettings {
            roots: vec![root.to_path_buf()],
            max_age: 7 * DAY,
            quota_bytes,
            dry_run: false,
            prune_empty_dirs: false,
        }
    }

    /// Eight 100-byte frames, one minute apart, oldest first.
    fn seed_frames(root: &Path, base: SystemTime) -> Vec<PathBuf> {
        (0..8)
            .map(|i| {
                let path = root.join("frames").join(format!("frame_{:02}.jpg", i));
                write_file(&path, 100, base + Duration::from_secs(60 * i));
                path
            })
            .collect()
    }

    #[test]
    fn test_quota_converges_oldest_first_skipping_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let files = seed_frames(dir.path(), now - Duration::from_secs(3600));

        let pins = PinRegistry::new();
        pins.pin(files[0].clone());

        let reaper = StorageReaper::new(settings(dir.path(), 500), pins);
        let report = reaper.sweep_at(now);

        assert_eq!(report.scanned, 8);
        assert_eq!(report.deleted_by_quota, 3);
        assert_eq!(report.deleted_by_age, 0);
        assert_eq!(report.skipped_pinned, 1);
        assert_eq!(report.bytes_reclaimed, 300);
        assert!(report.remaining_bytes <= 500);

        assert!(files[0].exists());
        assert!(files[1..4].iter().all(|p| !p.exists()));
        assert!(files[4..].iter().all(|p| p.exists()));
    }

    #[test]
    fn test_overlapping_roots_count_each_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let logs = dir.path().join("logs");
        let files: Vec<PathBuf> = (0..8)
            .map(|i| {
                let path = logs.join(format!("roomguard.log.{}", 8 - i));
                write_file(&path, 100, now - Duration::from_secs(3600 - 60 * i));
                path
            })
            .collect();

        let mut settings = settings(dir.path(), 500);
        settings.roots.push(logs);
        let report = StorageReaper::new(settings, PinRegistry::new()).sweep_at(now);

        assert_eq!(report.scanned, 8);
        assert_eq!(report.deleted_by_quota, 3);
        assert_eq!(report.failures, 0);
        assert_eq!(report.remaining_bytes, 500);
        assert!(files[..3].iter().all(|p| !p.exists()));
        assert!(files[3..].iter().all(|p| p.exists()));
    }

    #[test]
    fn test_age_pass_runs_before_quota() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let old = dir.path().join("logs/roomguard.log.3");
        write_file(&old, 10, now - 8 * DAY);
        let fresh = dir.path().join("logs/roomguard.log");
        write_file(&fresh, 10, now - Duration::from_secs(60));

        let reaper = StorageReaper::new(settings(dir.path(), 1_000_000), PinRegistry::new());
        let report = reaper.sweep_at(now);

        assert_eq!(report.deleted_by_age, 1);
        assert_eq!(report.deleted_by_quota, 0);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_pinned_file_survives_age_pass() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let path = dir.path().join("alerts/alert_1.zip");
        write_file(&path, 10, now - 30 * DAY);

        let pins = PinRegistry::new();
        let lease = pins.lease([path.clone()]);
        let reaper = StorageReaper::new(settings(dir.path(), 1_000_000), pins.clone());

        assert_eq!(reaper.sweep_at(now).skipped_pinned, 1);
        assert!(path.exists());

        drop(lease);
        assert!(pins.is_empty());
        assert_eq!(reaper.sweep_at(now).deleted_by_age, 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_dry_run_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let files = seed_frames(dir.path(), now - Duration::from_secs(3600));

        let mut settings = settings(dir.path(), 500);
        settings.dry_run = true;
        let report = StorageReaper::new(settings, PinRegistry::new()).sweep_at(now);

        assert!(report.dry_run);
        assert_eq!(report.deleted_by_quota, 3);
        assert_eq!(report.remaining_bytes, 500);
        assert!(files.iter().all(|p| p.exists()));
    }

    #[test]
    fn test_equal_mtimes_break_ties_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let when = now - Duration::from_secs(60);
        let a = dir.path().join("frame_a.jpg");
        let b = dir.path().join("frame_b.jpg");
        write_file(&b, 100, when);
        write_file(&a, 100, when);

        let reaper = StorageReaper::new(settings(dir.path(), 100), PinRegistry::new());
        reaper.sweep_at(now);

        assert!(!a.exists());
        assert!(b.exists());
    }

    #[test]
    fn test_prunes_empty_directories_but_keeps_root() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let path = dir.path().join("frames/2024/old.jpg");
        write_file(&path, 10, now - 30 * DAY);

        let mut settings = settings(dir.path(), 1_000_000);
        settings.prune_empty_dirs = true;
        StorageReaper::new(settings, PinRegistry::new()).sweep_at(now);

        assert!(!dir.path().join("frames").exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_missing_root_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir.path().join("does-not-exist"), 100);
        let report = StorageReaper::new(settings, PinRegistry::new()).sweep();
        assert_eq!(report, ReclaimReport::default());
    }

    #[test]
    fn test_pin_registry_counts_references() {
        let pins = PinRegistry::new();
        let path = PathBuf::from("/data/frame.jpg");
        let first = pins.lease([path.clone()]);
        let second = pins.lease([path.clone()]);
        drop(first);
        assert!(pins.is_pinned(&path));
        drop(second);
        assert!(!pins.is_pinned(&path));
    }
}
