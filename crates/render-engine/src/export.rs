//! Export configuration and job management.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kartlap_common::error::{KartlapError, KartlapResult};
use kartlap_session_model::chapters::{build_chapter_markers, write_chapter_file};
use kartlap_session_model::recording::VideoInfo;
use kartlap_session_model::timeline::SessionTimeline;
use tokio_util::sync::CancellationToken;

use crate::encoder::{
    build_encoder_plans, EncoderPlan, EncoderSettings, HardwareProbeCache, HardwareProbeResult,
    ProbeDetails,
};
use crate::ffmpeg::ProgressCallback;
use crate::overlay::filter_graph::OVERLAY_LABEL;
use crate::overlay::{
    EncodedOutputDescriptor, OverlayContext, OverlayOptions, OverlayRenderer, OverlayStyle,
};

/// Final video label mapped into the output.
pub const OUTPUT_LABEL: &str = "vout";

/// Chapter document written into the job's work dir.
pub const CHAPTERS_FILE_NAME: &str = "chapters.ffmeta";

/// An overlay export ready to be rendered.
#[derive(Debug, Clone)]
pub struct OverlayExportJob {
    /// Source session video.
    pub input_path: PathBuf,

    /// Output file path.
    pub output_path: PathBuf,

    /// Scratch directory for chapter files and staged frames.
    pub work_dir: PathBuf,

    pub video: VideoInfo,
    pub timeline: Arc<SessionTimeline>,

    /// Video time (seconds) at which lap 1 starts.
    pub start_offset_secs: f64,

    pub renderer: OverlayRenderer,
    pub style: OverlayStyle,
    pub options: OverlayOptions,
    pub prefer_hardware: bool,
    pub encoder_settings: EncoderSettings,

    /// Mux one chapter per lap into the output.
    pub chapters: bool,

    pub ffmpeg_binary: String,
}

impl OverlayExportJob {
    pub fn new(
        input_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        video: VideoInfo,
        timeline: SessionTimeline,
        start_offset_secs: f64,
    ) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            work_dir: work_dir.into(),
            video,
            timeline: Arc::new(timeline),
            start_offset_secs,
            renderer: OverlayRenderer::FilterGraph,
            style: OverlayStyle::default(),
            options: OverlayOptions::default(),
            prefer_hardware: true,
            encoder_settings: EncoderSettings::default(),
            chapters: true,
            ffmpeg_binary: "ffmpeg".to_string(),
        }
    }

    /// Paths the job reads or writes, for the cleanup sweep's active set.
    pub fn active_paths(&self) -> Vec<PathBuf> {
        vec![
            self.input_path.clone(),
            self.output_path.clone(),
            self.work_dir.clone(),
        ]
    }
}

/// Where the overlay pixels come from.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlaySource {
    /// drawtext graph body ending in `[ov]`.
    Graph(String),
    /// PNG panels on stdin.
    PipedFrames,
    /// Staged PNG panels (`frame_%06d.png`).
    FrameSequence(PathBuf),
}

/// Render the overlaid video for `job`.
///
/// Writes the chapter file (when enabled), resolves encoder plans through
/// `probe_cache`, and runs the job's overlay renderer.
pub async fn export_overlay(
    job: &OverlayExportJob,
    probe_cache: &HardwareProbeCache,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
) -> KartlapResult<EncodedOutputDescriptor> {
    job.video.validate()?;
    if !job.input_path.exists() {
        return Err(KartlapError::FileNotFound {
            path: job.input_path.clone(),
        });
    }
    if !job.start_offset_secs.is_finite() || job.start_offset_secs < 0.0 {
        return Err(KartlapError::validation(format!(
            "start offset must be a non-negative number of seconds, got {}",
            job.start_offset_secs
        )));
    }

    tokio::fs::create_dir_all(&job.work_dir).await?;
    if let Some(parent) = job.output_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let chapters_path = if job.chapters && !job.timeline.is_empty() {
        let markers = build_chapter_markers(
            job.timeline.laps(),
            job.start_offset_secs,
            Some(job.video.duration_ms()),
        );
        let path = job.work_dir.join(CHAPTERS_FILE_NAME);
        write_chapter_file(&path, &markers)?;
        tracing::debug!(path = %path.display(), chapters = markers.len(), "Wrote chapter file");
        Some(path)
    } else {
        None
    };

    let probe = if job.prefer_hardware {
        probe_cache.get_or_probe().await
    } else {
        Arc::new(HardwareProbeResult::unavailable(ProbeDetails::default()))
    };
    let plans = build_encoder_plans(&probe, job.prefer_hardware, &job.encoder_settings);

    let ctx = OverlayContext {
        ffmpeg_binary: job.ffmpeg_binary.clone(),
        input_path: job.input_path.clone(),
        output_path: job.output_path.clone(),
        work_dir: job.work_dir.clone(),
        video: job.video,
        timeline: Arc::clone(&job.timeline),
        start_offset_secs: job.start_offset_secs,
        style: job.style.clone(),
        options: job.options,
        plans,
        chapters_path,
        progress,
        cancel,
    };

    let output = job.renderer.render(&ctx).await?;
    tracing::info!(
        output = %output.output_path.display(),
        size_bytes = output.size_bytes,
        encoder = %output.encoder_label,
        "Overlay export complete"
    );
    Ok(output)
}

/// Full ffmpeg argument list for one encoder attempt.
pub fn build_encode_args(
    ctx: &OverlayContext,
    plan: &EncoderPlan,
    source: &OverlaySource,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-nostats".into(),
        "-progress".into(),
        "pipe:1".into(),
    ];
    args.extend(plan.input_options.iter().cloned());
    args.push("-i".into());
    args.push(path_arg(&ctx.input_path));

    let fps = ctx.video.fps.to_string();
    let body = match source {
        OverlaySource::Graph(body) => body.clone(),
        OverlaySource::PipedFrames => {
            args.extend([
                "-f".into(),
                "image2pipe".into(),
                "-framerate".into(),
                fps,
                "-c:v".into(),
                "png".into(),
                "-i".into(),
                "pipe:0".into(),
            ]);
            panel_overlay(ctx.style.margin)
        }
        OverlaySource::FrameSequence(pattern) => {
            args.extend([
                "-framerate".into(),
                fps,
                "-start_number".into(),
                "0".into(),
                "-i".into(),
                path_arg(pattern),
            ]);
            panel_overlay(ctx.style.margin)
        }
    };

    let chapters_input = match source {
        OverlaySource::Graph(_) => 1,
        _ => 2,
    };
    if let Some(chapters) = &ctx.chapters_path {
        args.extend([
            "-f".into(),
            "ffmetadata".into(),
            "-i".into(),
            path_arg(chapters),
        ]);
    }

    args.push("-filter_complex".into());
    args.push(finish_filter_graph(&body, plan));
    args.extend([
        "-map".into(),
        format!("[{OUTPUT_LABEL}]"),
        "-map".into(),
        "0:a?".into(),
    ]);
    if ctx.chapters_path.is_some() {
        args.extend([
            "-map_metadata".into(),
            chapters_input.to_string(),
            "-map_chapters".into(),
            chapters_input.to_string(),
        ]);
    }

    args.extend(plan.output_args());
    args.extend([
        "-c:a".into(),
        "copy".into(),
        "-t".into(),
        format!("{:.3}", ctx.video.duration),
        "-movflags".into(),
        "+faststart".into(),
    ]);
    args.push(path_arg(&ctx.output_path));
    args
}

/// Chain the plan's upload suffix after `[ov]`, ending in `[vout]`.
pub fn finish_filter_graph(body: &str, plan: &EncoderPlan) -> String {
    format!(
        "{body};[{OVERLAY_LABEL}]{}[{OUTPUT_LABEL}]",
        plan.filter_suffix.as_deref().unwrap_or("null")
    )
}

fn panel_overlay(margin: u32) -> String {
    format!("[0:v][1:v]overlay=x={margin}:y={margin}:format=auto:eof_action=pass[{OVERLAY_LABEL}]")
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
