//! Single-flight render job registry.
//!
//! At most one job runs per recording. A second start for the same
//! recording gets the first job's shared outcome; the entry is removed when
//! that outcome settles, whatever it is.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use kartlap_common::error::{KartlapError, KartlapResult};
use kartlap_session_model::recording::StatusUpdate;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cleanup::ActivePathProvider;
use crate::status::StatusStore;

/// Status error text written when a job is canceled.
pub const CANCELED_MESSAGE: &str = "Render canceled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderJobKind {
    Combine,
    Overlay,
}

/// What a finished job produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderOutput {
    pub output_path: PathBuf,
    pub size_bytes: u64,
    pub encoder_label: Option<String>,
}

/// Why a job failed. Cloneable so every waiter sees it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct JobFailure {
    pub message: String,
    pub cancelled: bool,
}

impl From<KartlapError> for JobFailure {
    fn from(err: KartlapError) -> Self {
        Self {
            cancelled: err.is_cancelled(),
            message: err.to_string(),
        }
    }
}

pub type JobOutcome = Result<RenderOutput, JobFailure>;

/// Outcome handle shared by every caller of the same job.
pub type SharedOutcome = Shared<BoxFuture<'static, JobOutcome>>;

/// Best-effort hook run when a job is canceled.
pub type CancelHook = Box<dyn FnOnce() -> KartlapResult<()> + Send>;

/// Registration details for a job.
pub struct RenderJobSpec {
    pub recording_id: String,
    pub user_id: String,
    pub kind: RenderJobKind,
    /// Files and directories the job uses; kept out of cleanup sweeps.
    pub paths: Vec<PathBuf>,
    pub on_cancel: Option<CancelHook>,
}

impl RenderJobSpec {
    pub fn new(
        recording_id: impl Into<String>,
        user_id: impl Into<String>,
        kind: RenderJobKind,
    ) -> Self {
        Self {
            recording_id: recording_id.into(),
            user_id: user_id.into(),
            kind,
            paths: Vec::new(),
            on_cancel: None,
        }
    }

    pub fn with_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_cancel_hook(mut self, hook: CancelHook) -> Self {
        self.on_cancel = Some(hook);
        self
    }
}

/// Snapshot row for admin listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveJobInfo {
    pub recording_id: String,
    pub user_id: String,
    pub kind: RenderJobKind,
    pub started_at: DateTime<Utc>,
    pub canceled: bool,
}

struct JobEntry {
    user_id: String,
    kind: RenderJobKind,
    started_at: DateTime<Utc>,
    canceled: bool,
    token: CancellationToken,
    on_cancel: Option<CancelHook>,
    outcome: SharedOutcome,
    paths: Vec<PathBuf>,
    seq: u64,
}

type Registry = Arc<Mutex<HashMap<String, JobEntry>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, JobEntry>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every in-flight render job.
pub struct RenderJobManager {
    jobs: Registry,
    next_seq: AtomicU64,
    status: Arc<dyn StatusStore>,
}

impl RenderJobManager {
    pub fn new(status: Arc<dyn StatusStore>) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
            status,
        }
    }

    /// Start `work` for the recording, or join the job already running.
    ///
    /// `work` receives the job's cancellation token and is only called when
    /// a new job is registered. The job runs on the tokio runtime whether or
    /// not the returned handle is awaited. Must be called inside a runtime.
    pub fn start_render_job<F, Fut>(&self, spec: RenderJobSpec, work: F) -> SharedOutcome
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = JobOutcome> + Send + 'static,
    {
        let mut jobs = lock(&self.jobs);
        if let Some(existing) = jobs.get(&spec.recording_id) {
            tracing::info!(
                recording_id = %spec.recording_id,
                "Render already running, joining existing job"
            );
            return existing.outcome.clone();
        }

        let token = CancellationToken::new();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let registry = Arc::clone(&self.jobs);
        let recording_id = spec.recording_id.clone();
        let work = work(token.clone());

        let outcome = async move {
            let result = work.await;
            let mut jobs = lock(&registry);
            if jobs.get(&recording_id).is_some_and(|entry| entry.seq == seq) {
                jobs.remove(&recording_id);
            }
            drop(jobs);
            match &result {
                Ok(output) => tracing::info!(
                    recording_id = %recording_id,
                    size_bytes = output.size_bytes,
                    "Render job finished"
                ),
                Err(failure) => tracing::warn!(
                    recording_id = %recording_id,
                    cancelled = failure.cancelled,
                    error = %failure.message,
                    "Render job failed"
                ),
            }
            result
        }
        .boxed()
        .shared();

        tracing::info!(
            recording_id = %spec.recording_id,
            user_id = %spec.user_id,
            kind = ?spec.kind,
            "Render job started"
        );
        jobs.insert(
            spec.recording_id,
            JobEntry {
                user_id: spec.user_id,
                kind: spec.kind,
                started_at: Utc::now(),
                canceled: false,
                token,
                on_cancel: spec.on_cancel,
                outcome: outcome.clone(),
                paths: spec.paths,
                seq,
            },
        );
        drop(jobs);

        tokio::spawn(outcome.clone());
        outcome
    }

    /// Cancel the job for `recording_id`.
    ///
    /// Returns `false` when no job is running or it was already canceled.
    /// Otherwise persists a `failed` status, triggers the job's token, and
    /// runs its cancel hook; hook errors are logged.
    pub async fn cancel_render_job(&self, recording_id: &str) -> bool {
        let (token, hook) = {
            let mut jobs = lock(&self.jobs);
            let Some(entry) = jobs.get_mut(recording_id) else {
                return false;
            };
            if entry.canceled {
                return false;
            }
            entry.canceled = true;
            (entry.token.clone(), entry.on_cancel.take())
        };

        tracing::info!(recording_id, "Canceling render job");
        if let Err(e) = self
            .status
            .update_status(recording_id, StatusUpdate::failed(CANCELED_MESSAGE))
            .await
        {
            tracing::error!(recording_id, error = %e, "Failed to persist cancel status");
        }

        token.cancel();

        if let Some(hook) = hook {
            if let Err(e) = hook() {
                tracing::warn!(recording_id, error = %e, "Cancel hook failed");
            }
        }
        true
    }

    /// Immutable snapshot of running jobs, oldest first.
    pub fn list_active_jobs(&self) -> Vec<ActiveJobInfo> {
        let jobs = lock(&self.jobs);
        let mut list: Vec<ActiveJobInfo> = jobs
            .iter()
            .map(|(recording_id, entry)| ActiveJobInfo {
                recording_id: recording_id.clone(),
                user_id: entry.user_id.clone(),
                kind: entry.kind,
                started_at: entry.started_at,
                canceled: entry.canceled,
            })
            .collect();
        list.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.recording_id.cmp(&b.recording_id))
        });
        list
    }

    pub fn is_running(&self, recording_id: &str) -> bool {
        lock(&self.jobs).contains_key(recording_id)
    }

    pub fn status_store(&self) -> Arc<dyn StatusStore> {
        Arc::clone(&self.status)
    }
}

impl ActivePathProvider for RenderJobManager {
    fn active_paths(&self) -> Vec<PathBuf> {
        lock(&self.jobs)
            .values()
            .flat_map(|entry| entry.paths.iter().cloned())
            .collect()
    }
}
