//! Render orchestration: runs engine jobs through the registry and keeps the
//! recording status current.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use kartlap_common::error::KartlapResult;
use kartlap_render_engine::combine::{combine_videos, CombineJob};
use kartlap_render_engine::encoder::HardwareProbeCache;
use kartlap_render_engine::ffmpeg::{EncodeProgress, ProgressCallback};
use kartlap_render_engine::{export_overlay, OverlayExportJob};
use kartlap_session_model::recording::StatusUpdate;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::jobs::{
    ActiveJobInfo, JobFailure, RenderJobKind, RenderJobManager, RenderJobSpec, RenderOutput,
    SharedOutcome, CANCELED_MESSAGE,
};
use crate::status::StatusStore;

/// Front door for starting and canceling renders.
#[derive(Clone)]
pub struct RenderService {
    jobs: Arc<RenderJobManager>,
    status: Arc<dyn StatusStore>,
    probe_cache: Arc<HardwareProbeCache>,
}

impl RenderService {
    pub fn new(status: Arc<dyn StatusStore>, probe_cache: Arc<HardwareProbeCache>) -> Self {
        Self {
            jobs: Arc::new(RenderJobManager::new(Arc::clone(&status))),
            status,
            probe_cache,
        }
    }

    pub fn jobs(&self) -> Arc<RenderJobManager> {
        Arc::clone(&self.jobs)
    }

    pub fn probe_cache(&self) -> Arc<HardwareProbeCache> {
        Arc::clone(&self.probe_cache)
    }

    /// Burn the lap overlay into a recording.
    pub fn start_overlay(
        &self,
        recording_id: &str,
        user_id: &str,
        job: OverlayExportJob,
    ) -> SharedOutcome {
        let spec = RenderJobSpec::new(recording_id, user_id, RenderJobKind::Overlay)
            .with_paths(job.active_paths())
            .with_cancel_hook(remove_partial_output(job.output_path.clone()));
        let status = Arc::clone(&self.status);
        let probe_cache = Arc::clone(&self.probe_cache);
        let recording_id = recording_id.to_string();
        let fps = job.video.fps;

        self.jobs.start_render_job(spec, move |cancel| async move {
            run_tracked(status, recording_id, Some(fps), move |progress| async move {
                let output = export_overlay(&job, &probe_cache, Some(progress), cancel).await?;
                Ok(RenderOutput {
                    output_path: output.output_path,
                    size_bytes: output.size_bytes,
                    encoder_label: Some(output.encoder_label),
                })
            })
            .await
        })
    }

    /// Join a recording's clips into one file.
    pub fn start_combine(&self, recording_id: &str, user_id: &str, job: CombineJob) -> SharedOutcome {
        let spec = RenderJobSpec::new(recording_id, user_id, RenderJobKind::Combine)
            .with_paths(job.active_paths())
            .with_cancel_hook(remove_partial_output(job.output_path.clone()));
        let status = Arc::clone(&self.status);
        let recording_id = recording_id.to_string();

        self.jobs.start_render_job(spec, move |cancel| async move {
            run_tracked(status, recording_id, None, move |progress| async move {
                let size_bytes = combine_videos(&job, Some(progress), &cancel).await?;
                Ok(RenderOutput {
                    output_path: job.output_path.clone(),
                    size_bytes,
                    encoder_label: None,
                })
            })
            .await
        })
    }

    pub async fn cancel(&self, recording_id: &str) -> bool {
        self.jobs.cancel_render_job(recording_id).await
    }

    pub fn list_active_jobs(&self) -> Vec<ActiveJobInfo> {
        self.jobs.list_active_jobs()
    }
}

/// Run `work` with status tracking around it.
///
/// `processing` is written first, progress updates follow in increasing
/// order, and the terminal status is written only after every progress write
/// has landed. A canceled run rewrites the cancel status last, since
/// progress writes queued before the cancel may land after it.
async fn run_tracked<F, Fut>(
    status: Arc<dyn StatusStore>,
    recording_id: String,
    fps: Option<f64>,
    work: F,
) -> Result<RenderOutput, JobFailure>
where
    F: FnOnce(ProgressCallback) -> Fut,
    Fut: std::future::Future<Output = KartlapResult<RenderOutput>>,
{
    persist(&*status, &recording_id, StatusUpdate::processing(0)).await;

    let (progress, writer) = progress_forwarder(Arc::clone(&status), recording_id.clone());
    let result = work(progress).await;
    if let Err(e) = writer.await {
        tracing::warn!(recording_id = %recording_id, error = %e, "Progress writer panicked");
    }

    match result {
        Ok(output) => {
            persist(
                &*status,
                &recording_id,
                StatusUpdate::ready(output.size_bytes, fps),
            )
            .await;
            Ok(output)
        }
        Err(e) if e.is_cancelled() => {
            persist(&*status, &recording_id, StatusUpdate::failed(CANCELED_MESSAGE)).await;
            Err(JobFailure::from(e))
        }
        Err(e) => {
            persist(&*status, &recording_id, StatusUpdate::failed(e.to_string())).await;
            Err(JobFailure::from(e))
        }
    }
}

/// A progress callback that only passes increasing percentages on, and the
/// task writing them. The task ends once every clone of the callback is
/// dropped.
fn progress_forwarder(
    status: Arc<dyn StatusStore>,
    recording_id: String,
) -> (ProgressCallback, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
    let last = AtomicU8::new(0);
    let callback: ProgressCallback = Arc::new(move |p: EncodeProgress| {
        let percent = p.percent().min(99);
        if last.fetch_max(percent, Ordering::SeqCst) < percent {
            let _ = tx.send(percent);
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(percent) = rx.recv().await {
            persist(&*status, &recording_id, StatusUpdate::processing(percent)).await;
        }
    });
    (callback, writer)
}

async fn persist(status: &dyn StatusStore, recording_id: &str, update: StatusUpdate) {
    if let Err(e) = status.update_status(recording_id, update).await {
        tracing::error!(recording_id, error = %e, "Failed to persist recording status");
    }
}

fn remove_partial_output(path: PathBuf) -> crate::jobs::CancelHook {
    Box::new(move || remove_if_exists(&path))
}

fn remove_if_exists(path: &Path) -> KartlapResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed partial output");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
