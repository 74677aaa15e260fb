//! Retention sweep and usage stats for temp directories.
//!
//! Files and symlinks older than the retention window are deleted.
//! Directories are visited after their contents and deleted only when they
//! were stale before the sweep and are empty after it. Roots are never
//! deleted, and neither is anything on, above, or below an active path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use kartlap_common::error::KartlapError;
use serde::Serialize;
use walkdir::WalkDir;

/// Supplies paths in use by running jobs or uploads.
pub trait ActivePathProvider: Send + Sync {
    fn active_paths(&self) -> Vec<PathBuf>;
}

/// Fixed set of active paths.
#[derive(Debug, Clone, Default)]
pub struct StaticActivePaths(pub Vec<PathBuf>);

impl ActivePathProvider for StaticActivePaths {
    fn active_paths(&self) -> Vec<PathBuf> {
        self.0.clone()
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub files_removed: u64,
    pub dirs_removed: u64,
    pub bytes_freed: u64,
    pub skipped_active: u64,
    pub errors: Vec<String>,
}

/// Usage of one temp root.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TempDirStats {
    pub root: PathBuf,
    pub exists: bool,
    pub file_count: u64,
    pub dir_count: u64,
    pub total_bytes: u64,
    pub oldest_modified: Option<DateTime<Utc>>,
}

/// Delete stale entries under each root.
///
/// Per-entry failures are logged and recorded in the report; they never
/// stop the sweep.
pub fn cleanup_temp_directories(
    roots: &[PathBuf],
    now: SystemTime,
    max_age: Duration,
    active: &[PathBuf],
) -> CleanupReport {
    let mut report = CleanupReport::default();
    let active: Vec<PathBuf> = active.iter().map(|p| normalize(p)).collect();

    for root in roots {
        if !root.is_dir() {
            tracing::debug!(root = %root.display(), "Temp root missing, skipping");
            continue;
        }
        let root_norm = normalize(root);

        // Directory ages are taken before any child is removed, since a
        // removal bumps the parent's mtime.
        let dir_mtimes: HashMap<PathBuf, SystemTime> = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_dir())
            .filter_map(|entry| {
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((entry.into_path(), modified))
            })
            .collect();

        for entry in WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .contents_first(true)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    record_error(&mut report, e.path().unwrap_or(root), e.to_string());
                    continue;
                }
            };
            let path = entry.path();
            if normalize(path) == root_norm {
                continue;
            }
            if is_protected(&normalize(path), &active) {
                report.skipped_active += 1;
                continue;
            }

            if entry.file_type().is_dir() {
                let Some(modified) = dir_mtimes.get(path).copied() else {
                    continue;
                };
                if !is_stale(now, modified, max_age) || !is_empty_dir(path) {
                    continue;
                }
                match std::fs::remove_dir(path) {
                    Ok(()) => {
                        report.dirs_removed += 1;
                        tracing::debug!(path = %path.display(), "Removed stale directory");
                    }
                    Err(e) => record_error(&mut report, path, e.to_string()),
                }
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    record_error(&mut report, path, e.to_string());
                    continue;
                }
            };
            let modified = match metadata.modified() {
                Ok(modified) => modified,
                Err(e) => {
                    record_error(&mut report, path, e.to_string());
                    continue;
                }
            };
            if !is_stale(now, modified, max_age) {
                continue;
            }
            match std::fs::remove_file(path) {
                Ok(()) => {
                    report.files_removed += 1;
                    report.bytes_freed += metadata.len();
                    tracing::debug!(path = %path.display(), "Removed stale file");
                }
                Err(e) => record_error(&mut report, path, e.to_string()),
            }
        }
    }

    tracing::info!(
        files_removed = report.files_removed,
        dirs_removed = report.dirs_removed,
        bytes_freed = report.bytes_freed,
        skipped_active = report.skipped_active,
        errors = report.errors.len(),
        "Temp cleanup finished"
    );
    report
}

/// File count, dir count, size and oldest mtime per root.
pub fn temp_directory_stats(roots: &[PathBuf]) -> Vec<TempDirStats> {
    roots
        .iter()
        .map(|root| {
            let mut stats = TempDirStats {
                root: root.clone(),
                exists: root.is_dir(),
                file_count: 0,
                dir_count: 0,
                total_bytes: 0,
                oldest_modified: None,
            };
            if !stats.exists {
                return stats;
            }

            let mut oldest: Option<SystemTime> = None;
            for entry in WalkDir::new(root)
                .min_depth(1)
                .follow_links(false)
                .into_iter()
                .filter_map(Result::ok)
            {
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                if entry.file_type().is_dir() {
                    stats.dir_count += 1;
                } else {
                    stats.file_count += 1;
                    stats.total_bytes += metadata.len();
                }
                if let Ok(modified) = metadata.modified() {
                    oldest = Some(oldest.map_or(modified, |o| o.min(modified)));
                }
            }
            stats.oldest_modified = oldest.map(DateTime::<Utc>::from);
            stats
        })
        .collect()
}

fn is_stale(now: SystemTime, modified: SystemTime, max_age: Duration) -> bool {
    now.duration_since(modified)
        .map(|age| age > max_age)
        .unwrap_or(false)
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// On an active path, an ancestor of one, or inside an active directory.
fn is_protected(path: &Path, active: &[PathBuf]) -> bool {
    active
        .iter()
        .any(|active| active.starts_with(path) || path.starts_with(active))
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn record_error(report: &mut CleanupReport, path: &Path, message: String) {
    let err = KartlapError::ResourceCleanup {
        path: path.to_path_buf(),
        message,
    };
    tracing::warn!(error = %err, "Cleanup entry skipped");
    report.errors.push(err.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};

    const HOUR: Duration = Duration::from_secs(3600);

    fn age(path: &Path, now: SystemTime, by: Duration) {
        set_file_mtime(path, FileTime::from_system_time(now - by)).unwrap();
    }

    #[test]
    fn test_stale_file_removed_fresh_kept() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let old = dir.path().join("old.png");
        let new = dir.path().join("new.png");
        std::fs::write(&old, b"12345").unwrap();
        std::fs::write(&new, b"x").unwrap();
        age(&old, now, 48 * HOUR);

        let report = cleanup_temp_directories(&[dir.path().to_path_buf()], now, 24 * HOUR, &[]);
        assert!(!old.exists());
        assert!(new.exists());
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.bytes_freed, 5);
        assert!(dir.path().exists());
    }

    #[test]
    fn test_empty_stale_directory_removed() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let empty = dir.path().join("job-1");
        std::fs::create_dir(&empty).unwrap();
        age(&empty, now, 48 * HOUR);

        let report = cleanup_temp_directories(&[dir.path().to_path_buf()], now, 24 * HOUR, &[]);
        assert!(!empty.exists());
        assert_eq!(report.dirs_removed, 1);
    }

    #[test]
    fn test_stale_directory_with_fresh_child_kept() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let job = dir.path().join("job-2");
        std::fs::create_dir(&job).unwrap();
        let stale = job.join("frame_000000.png");
        let fresh = job.join("frame_000001.png");
        std::fs::write(&stale, b"a").unwrap();
        std::fs::write(&fresh, b"b").unwrap();
        age(&stale, now, 48 * HOUR);
        age(&job, now, 48 * HOUR);

        cleanup_temp_directories(&[dir.path().to_path_buf()], now, 24 * HOUR, &[]);
        assert!(job.exists());
        assert!(fresh.exists());
        assert!(!stale.exists());
    }

    #[test]
    fn test_directory_emptied_by_sweep_is_removed_when_stale() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let job = dir.path().join("job-3");
        std::fs::create_dir(&job).unwrap();
        let stale = job.join("chapters.ffmeta");
        std::fs::write(&stale, b"a").unwrap();
        age(&stale, now, 48 * HOUR);
        age(&job, now, 48 * HOUR);

        let report = cleanup_temp_directories(&[dir.path().to_path_buf()], now, 24 * HOUR, &[]);
        assert!(!job.exists());
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.dirs_removed, 1);
    }

    #[test]
    fn test_active_paths_are_protected() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let job = dir.path().join("job-4");
        std::fs::create_dir(&job).unwrap();
        let input = job.join("upload.mp4");
        std::fs::write(&input, b"video").unwrap();
        age(&input, now, 48 * HOUR);
        age(&job, now, 48 * HOUR);

        let report = cleanup_temp_directories(
            &[dir.path().to_path_buf()],
            now,
            24 * HOUR,
            &[input.clone()],
        );
        assert!(input.exists());
        assert!(job.exists());
        assert_eq!(report.skipped_active, 2);
    }

    #[test]
    fn test_missing_root_is_ignored() {
        let report = cleanup_temp_directories(
            &[PathBuf::from("/no/such/kartlap/root")],
            SystemTime::now(),
            HOUR,
            &[],
        );
        assert_eq!(report, CleanupReport::default());
    }

    #[test]
    fn test_temp_directory_stats() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/one.bin"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("two.bin"), vec![0u8; 5]).unwrap();
        age(&dir.path().join("two.bin"), now, 5 * HOUR);

        let stats = temp_directory_stats(&[
            dir.path().to_path_buf(),
            PathBuf::from("/no/such/kartlap/root"),
        ]);
        assert_eq!(stats[0].file_count, 2);
        assert_eq!(stats[0].dir_count, 1);
        assert_eq!(stats[0].total_bytes, 15);
        let oldest = stats[0].oldest_modified.unwrap();
        assert!(Utc::now() - oldest >= chrono::Duration::hours(4));
        assert!(!stats[1].exists);
        assert_eq!(stats[1].file_count, 0);
    }
}
