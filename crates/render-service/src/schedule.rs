//! Persisted cleanup schedule and the task that runs it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Datelike, Local, TimeZone, Utc};
use kartlap_common::error::{KartlapError, KartlapResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cleanup::{cleanup_temp_directories, ActivePathProvider, CleanupReport};

/// When the cleanup sweep runs. Days are 0 = Sunday .. 6 = Saturday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSchedule {
    pub hour: u8,
    #[serde(default)]
    pub days: BTreeSet<u8>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Default for CleanupSchedule {
    fn default() -> Self {
        Self {
            hour: 3,
            days: BTreeSet::new(),
            last_run_at: None,
        }
    }
}

impl CleanupSchedule {
    pub fn new(hour: u8, days: impl IntoIterator<Item = u8>) -> KartlapResult<Self> {
        let schedule = Self {
            hour,
            days: days.into_iter().collect(),
            last_run_at: None,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> KartlapResult<()> {
        if self.hour > 23 {
            return Err(KartlapError::validation(format!(
                "cleanup hour must be 0-23, got {}",
                self.hour
            )));
        }
        if let Some(day) = self.days.iter().find(|d| **d > 6) {
            return Err(KartlapError::validation(format!(
                "cleanup day must be 0-6 (0 = Sunday), got {day}"
            )));
        }
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        !self.days.is_empty()
    }

    /// Next scheduled instant strictly after `now`, in `now`'s timezone.
    pub fn next_run_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        if !self.enabled() || self.hour > 23 {
            return None;
        }
        let tz = now.timezone();
        let today = now.date_naive();
        (0..=7u64)
            .filter_map(|offset| today.checked_add_days(chrono::Days::new(offset)))
            .filter(|date| {
                let weekday = date.weekday().num_days_from_sunday() as u8;
                self.days.contains(&weekday)
            })
            .filter_map(|date| date.and_hms_opt(u32::from(self.hour), 0, 0))
            .filter_map(|naive| tz.from_local_datetime(&naive).earliest())
            .find(|candidate| candidate > now)
    }
}

/// Read the schedule, or the disabled default when the file does not exist.
pub fn load_schedule(path: &Path) -> KartlapResult<CleanupSchedule> {
    if !path.exists() {
        return Ok(CleanupSchedule::default());
    }
    let content = std::fs::read_to_string(path)?;
    let schedule: CleanupSchedule = serde_json::from_str(&content)?;
    schedule.validate()?;
    Ok(schedule)
}

pub fn save_schedule(path: &Path, schedule: &CleanupSchedule) -> KartlapResult<()> {
    schedule.validate()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(schedule)?)?;
    Ok(())
}

/// Result of a manual trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunNowResult {
    /// `false` when a sweep was already running.
    pub started: bool,
    pub report: Option<CleanupReport>,
}

struct SchedulerInner {
    roots: Vec<PathBuf>,
    max_age: Duration,
    schedule_path: PathBuf,
    schedule: Mutex<CleanupSchedule>,
    running: AtomicBool,
    active: Arc<dyn ActivePathProvider>,
    changed: Notify,
}

/// Runs the sweep on schedule or on demand, never twice at once.
#[derive(Clone)]
pub struct CleanupScheduler {
    inner: Arc<SchedulerInner>,
}

impl CleanupScheduler {
    pub fn new(
        roots: Vec<PathBuf>,
        max_age: Duration,
        schedule_path: PathBuf,
        active: Arc<dyn ActivePathProvider>,
    ) -> KartlapResult<Self> {
        let schedule = load_schedule(&schedule_path)?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                roots,
                max_age,
                schedule_path,
                schedule: Mutex::new(schedule),
                running: AtomicBool::new(false),
                active,
                changed: Notify::new(),
            }),
        })
    }

    pub fn schedule(&self) -> CleanupSchedule {
        self.inner
            .schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace hour and days, persist, and wake the timer.
    pub fn update_schedule(&self, hour: u8, days: BTreeSet<u8>) -> KartlapResult<CleanupSchedule> {
        let updated = {
            let mut schedule = self
                .inner
                .schedule
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let candidate = CleanupSchedule {
                hour,
                days,
                last_run_at: schedule.last_run_at,
            };
            candidate.validate()?;
            *schedule = candidate.clone();
            candidate
        };
        save_schedule(&self.inner.schedule_path, &updated)?;
        self.inner.changed.notify_one();
        tracing::info!(hour = updated.hour, days = ?updated.days, "Cleanup schedule updated");
        Ok(updated)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Sweep now unless a sweep is already in progress.
    pub async fn run_now(&self) -> KartlapResult<RunNowResult> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("Cleanup already running, ignoring trigger");
            return Ok(RunNowResult {
                started: false,
                report: None,
            });
        }

        let _running = RunningGuard(&self.inner.running);

        let inner = Arc::clone(&self.inner);
        let swept = tokio::task::spawn_blocking(move || {
            let active = inner.active.active_paths();
            cleanup_temp_directories(&inner.roots, SystemTime::now(), inner.max_age, &active)
        })
        .await;

        let report =
            swept.map_err(|e| KartlapError::render(format!("cleanup task panicked: {e}")))?;

        let stamped = {
            let mut schedule = self
                .inner
                .schedule
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            schedule.last_run_at = Some(Utc::now());
            schedule.clone()
        };
        save_schedule(&self.inner.schedule_path, &stamped)?;
        self.inner.changed.notify_one();

        Ok(RunNowResult {
            started: true,
            report: Some(report),
        })
    }

    /// Spawn the timer loop. It exits when `shutdown` is canceled.
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let next = scheduler.schedule().next_run_at(&Local::now());
                let wait = next.map(|at| {
                    (at - Local::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                });
                if let Some(at) = &next {
                    tracing::debug!(next_run_at = %at, "Cleanup scheduled");
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = scheduler.inner.changed.notified() => continue,
                    _ = sleep_or_forever(wait) => {
                        if let Err(e) = scheduler.run_now().await {
                            tracing::error!(error = %e, "Scheduled cleanup failed");
                        }
                    }
                }
            }
            tracing::debug!("Cleanup scheduler stopped");
        })
    }
}

/// Clears the running flag when the run ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn sleep_or_forever(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::StaticActivePaths;
    use chrono::FixedOffset;
    use std::sync::Barrier;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_disabled_without_days() {
        let schedule = CleanupSchedule::new(3, []).unwrap();
        assert!(!schedule.enabled());
        assert!(schedule.next_run_at(&at(2024, 6, 5, 1, 0)).is_none());
    }

    #[test]
    fn test_next_run_today_when_hour_not_passed() {
        // 2024-06-05 is a Wednesday (3).
        let schedule = CleanupSchedule::new(3, [3]).unwrap();
        assert_eq!(
            schedule.next_run_at(&at(2024, 6, 5, 1, 30)),
            Some(at(2024, 6, 5, 3, 0))
        );
    }

    #[test]
    fn test_next_run_tomorrow_when_hour_passed() {
        let schedule = CleanupSchedule::new(3, [3, 4]).unwrap();
        assert_eq!(
            schedule.next_run_at(&at(2024, 6, 5, 3, 0)),
            Some(at(2024, 6, 6, 3, 0))
        );
    }

    #[test]
    fn test_next_run_next_week() {
        let schedule = CleanupSchedule::new(3, [3]).unwrap();
        assert_eq!(
            schedule.next_run_at(&at(2024, 6, 5, 4, 0)),
            Some(at(2024, 6, 12, 3, 0))
        );
    }

    #[test]
    fn test_sunday_is_day_zero() {
        let schedule = CleanupSchedule::new(23, [0]).unwrap();
        assert_eq!(
            schedule.next_run_at(&at(2024, 6, 5, 4, 0)),
            Some(at(2024, 6, 9, 23, 0))
        );
    }

    #[test]
    fn test_validation() {
        assert!(CleanupSchedule::new(24, [1]).is_err());
        assert!(CleanupSchedule::new(3, [7]).is_err());
    }

    #[test]
    fn test_schedule_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/cleanup-schedule.json");
        assert_eq!(load_schedule(&path).unwrap(), CleanupSchedule::default());

        let schedule = CleanupSchedule::new(5, [1, 3, 5]).unwrap();
        save_schedule(&path, &schedule).unwrap();
        let json = std::fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"lastRunAt\""));
        assert_eq!(load_schedule(&path).unwrap(), schedule);
    }

    fn scheduler(dir: &Path) -> CleanupScheduler {
        CleanupScheduler::new(
            vec![dir.join("tmp")],
            Duration::from_secs(3600),
            dir.join("schedule.json"),
            Arc::new(StaticActivePaths::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_now_stamps_last_run() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path());
        let result = scheduler.run_now().await.unwrap();
        assert!(result.started);
        assert!(result.report.is_some());
        assert!(scheduler.schedule().last_run_at.is_some());
        assert!(load_schedule(&dir.path().join("schedule.json"))
            .unwrap()
            .last_run_at
            .is_some());
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_run_now_while_running_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path());
        scheduler.inner.running.store(true, Ordering::SeqCst);

        let result = scheduler.run_now().await.unwrap();
        assert!(!result.started);
        assert!(result.report.is_none());
        assert!(scheduler.schedule().last_run_at.is_none());
    }

    /// Holds the sweep inside `active_paths` until the test releases it.
    struct GatedActivePaths(Arc<Barrier>);

    impl ActivePathProvider for GatedActivePaths {
        fn active_paths(&self) -> Vec<PathBuf> {
            self.0.wait();
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_concurrent_run_now_starts_once() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Barrier::new(2));
        let scheduler = CleanupScheduler::new(
            vec![dir.path().join("tmp")],
            Duration::from_secs(3600),
            dir.path().join("schedule.json"),
            Arc::new(GatedActivePaths(Arc::clone(&gate))),
        )
        .unwrap();

        let release = {
            let gate = Arc::clone(&gate);
            let scheduler = scheduler.clone();
            async move {
                // The second trigger has been answered before the sweep is let go.
                while !scheduler.is_running() {
                    tokio::task::yield_now().await;
                }
                let stamped_early = scheduler.schedule().last_run_at;
                tokio::task::spawn_blocking(move || {
                    gate.wait();
                })
                .await
                .unwrap();
                stamped_early
            }
        };

        let (first, second, stamped_early) =
            tokio::join!(scheduler.run_now(), scheduler.run_now(), release);
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(
            [first.started, second.started].iter().filter(|s| **s).count(),
            1
        );
        assert!(stamped_early.is_none());
        assert!(!scheduler.is_running());

        let stamp = scheduler.schedule().last_run_at;
        assert!(stamp.is_some());
        let stored = load_schedule(&dir.path().join("schedule.json")).unwrap();
        assert_eq!(stored.last_run_at, stamp);
    }

    #[tokio::test]
    async fn test_update_schedule_persists() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path());
        scheduler.update_schedule(4, BTreeSet::from([2])).unwrap();
        assert!(scheduler.update_schedule(30, BTreeSet::new()).is_err());

        let stored = load_schedule(&dir.path().join("schedule.json")).unwrap();
        assert_eq!(stored.hour, 4);
        assert!(stored.enabled());
        assert_eq!(scheduler.schedule().hour, 4);
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path());
        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn(shutdown.clone());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
