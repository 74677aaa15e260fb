//! Join several session clips into one video without re-encoding.

use std::path::{Path, PathBuf};

use kartlap_common::error::{KartlapError, KartlapResult};
use tokio_util::sync::CancellationToken;

use crate::ffmpeg::{FfmpegProcess, ProgressCallback};

pub const CONCAT_LIST_FILE_NAME: &str = "concat.txt";

/// Clips to join, in playback order.
#[derive(Debug, Clone)]
pub struct CombineJob {
    pub inputs: Vec<PathBuf>,
    pub output_path: PathBuf,
    pub work_dir: PathBuf,
    /// Sum of the clip durations, for progress. Zero disables the fraction.
    pub expected_duration_secs: f64,
    pub ffmpeg_binary: String,
}

impl CombineJob {
    pub fn active_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.inputs.clone();
        paths.push(self.output_path.clone());
        paths.push(self.work_dir.clone());
        paths
    }
}

/// Concat demuxer list for `inputs`.
pub fn build_concat_list(inputs: &[PathBuf]) -> String {
    inputs
        .iter()
        .map(|path| {
            let escaped = path.to_string_lossy().replace('\'', "'\\''");
            format!("file '{escaped}'\n")
        })
        .collect()
}

/// Run the concat. Returns the output size in bytes.
pub async fn combine_videos(
    job: &CombineJob,
    progress: Option<ProgressCallback>,
    cancel: &CancellationToken,
) -> KartlapResult<u64> {
    if job.inputs.is_empty() {
        return Err(KartlapError::validation("nothing to combine"));
    }
    for input in &job.inputs {
        if !input.exists() {
            return Err(KartlapError::FileNotFound {
                path: input.clone(),
            });
        }
    }

    tokio::fs::create_dir_all(&job.work_dir).await?;
    let list_path = job.work_dir.join(CONCAT_LIST_FILE_NAME);
    tokio::fs::write(&list_path, build_concat_list(&job.inputs)).await?;

    let args = concat_args(&list_path, &job.output_path);
    tracing::info!(
        clips = job.inputs.len(),
        output = %job.output_path.display(),
        "Combining clips"
    );

    let process = FfmpegProcess::spawn(&job.ffmpeg_binary, &args, false, "concat")?;
    process
        .wait(job.expected_duration_secs, 0, progress, cancel)
        .await?;

    Ok(tokio::fs::metadata(&job.output_path).await?.len())
}

fn concat_args(list_path: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-nostats".into(),
        "-progress".into(),
        "pipe:1".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list_path.to_string_lossy().into_owned(),
        "-c".into(),
        "copy".into(),
        "-movflags".into(),
        "+faststart".into(),
        output.to_string_lossy().into_owned(),
    ]
}
