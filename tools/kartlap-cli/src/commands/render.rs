//! Burn the lap overlay into a session video.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kartlap_common::clock::StartOffset;
use kartlap_common::config::AppConfig;
use kartlap_render_engine::encoder::{EncoderSettings, HardwareProbeCache};
use kartlap_render_engine::export::{export_overlay, OverlayExportJob};
use kartlap_render_engine::ffmpeg::{EncodeProgress, ProgressCallback};
use kartlap_render_engine::overlay::{OverlayMode, OverlayRenderer};
use kartlap_render_engine::probe::{command_exists, probe_video};
use kartlap_session_model::timeline::SessionTimeline;
use tokio_util::sync::CancellationToken;

pub struct RenderArgs {
    pub video: PathBuf,
    pub laps: PathBuf,
    pub format: Option<String>,
    pub driver: Option<String>,
    pub start: StartOffset,
    pub output: Option<PathBuf>,
    pub mode: Option<String>,
    pub prefer_hardware: bool,
    pub deltas: bool,
    pub chapters: bool,
}

pub async fn run(config: &AppConfig, args: RenderArgs) -> anyhow::Result<()> {
    for binary in ["ffmpeg", "ffprobe"] {
        if !command_exists(binary) {
            anyhow::bail!("{binary} not found on PATH");
        }
    }

    println!("Rendering lap overlay for: {}", args.video.display());

    let laps = super::load_laps(&args.laps, args.format.as_deref(), args.driver.as_deref())?;
    let timeline = SessionTimeline::normalize(laps)?;
    let video = probe_video("ffprobe", &args.video).await?;
    let start_offset_secs = args.start.resolve_secs(video.fps)?;

    let mode: OverlayMode = args
        .mode
        .as_deref()
        .unwrap_or(config.render.overlay_mode.as_str())
        .parse()?;
    let output_path = args
        .output
        .unwrap_or_else(|| default_output_path(&args.video));
    let work_dir = work_dir_root(config).join(format!("render-{}", std::process::id()));

    println!("  Laps: {}", timeline.len());
    println!("  Video: {}x{} @ {:.3}fps", video.width, video.height, video.fps);
    println!("  Lap 1 starts at: {start_offset_secs:.3}s");
    println!("  Mode: {mode:?}");
    println!("  Output: {}", output_path.display());

    let mut job = OverlayExportJob::new(
        &args.video,
        &output_path,
        &work_dir,
        video,
        timeline,
        start_offset_secs,
    );
    job.renderer = OverlayRenderer::from_mode(mode, config.render.raster_channel_frames);
    job.style.font_path = config.render.font_path.clone();
    job.options.show_lap_deltas = args.deltas;
    job.prefer_hardware = args.prefer_hardware && config.render.prefer_hardware;
    job.encoder_settings = EncoderSettings::from(&config.render);
    job.chapters = args.chapters;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let progress_cb: ProgressCallback = Arc::new(|p: EncodeProgress| {
        print!(
            "\r  Progress: {:.1}% ({}/{} frames, ETA: {:.0}s)  ",
            p.progress * 100.0,
            p.frames_rendered,
            p.total_frames,
            p.eta_secs,
        );
        let _ = std::io::stdout().flush();
    });

    let probe_cache = HardwareProbeCache::default();
    let result = export_overlay(&job, &probe_cache, Some(progress_cb), cancel).await;

    if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
        tracing::debug!(path = %work_dir.display(), error = %e, "Work dir not removed");
    }

    match result {
        Ok(output) => {
            println!(
                "\nRender complete: {} ({} bytes, encoder: {})",
                output.output_path.display(),
                output.size_bytes,
                output.encoder_label
            );
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            println!("\nRender canceled");
            Ok(())
        }
        Err(e) => {
            if let Some(diagnostics) = e.diagnostics() {
                eprintln!("\nffmpeg output:\n{diagnostics}");
            }
            Err(anyhow::anyhow!("Render failed: {e}"))
        }
    }
}

fn default_output_path(video: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session".to_string());
    video.with_file_name(format!("{stem}_laps.mp4"))
}

fn work_dir_root(config: &AppConfig) -> PathBuf {
    config
        .temp_roots
        .first()
        .cloned()
        .unwrap_or_else(|| std::env::temp_dir().join("kartlap"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path(Path::new("/videos/heat-3.mov")),
            PathBuf::from("/videos/heat-3_laps.mp4")
        );
    }
}
