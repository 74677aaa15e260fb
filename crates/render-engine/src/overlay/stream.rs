//! Raster frame delivery to the encoder.
//!
//! Frames are drawn on a blocking worker and handed to the async writer
//! over a bounded channel. The writer awaits the encoder's stdin, so a slow
//! encoder stalls the writer, the channel fills, and the worker blocks.
//! Frames are written in index order and never dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kartlap_common::error::{KartlapError, KartlapResult};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::raster::{FrameRenderer, PngPanelPainter};
use super::OverlayContext;
use crate::encoder::{run_encoding_attempts, EncoderPlan};
use crate::export::{build_encode_args, OverlaySource};
use crate::ffmpeg::FfmpegProcess;

/// File name pattern of staged frames (ffmpeg image2 syntax).
pub const FRAME_PATTERN: &str = "frame_%06d.png";

/// Written after the last staged frame.
pub const STAGING_COMPLETE_MARKER: &str = ".complete";

/// Stream `total_frames` frames into `sink` in order, then close it.
///
/// Returns the number of frames written.
pub async fn stream_frames<W>(
    renderer: Arc<FrameRenderer>,
    total_frames: u64,
    channel_frames: usize,
    mut sink: W,
    cancel: &CancellationToken,
) -> KartlapResult<u64>
where
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel::<Arc<Vec<u8>>>(channel_frames.max(1));
    let producer_cancel = cancel.clone();
    let producer = tokio::task::spawn_blocking(move || -> KartlapResult<()> {
        for frame_index in 0..total_frames {
            if producer_cancel.is_cancelled() {
                return Ok(());
            }
            let frame = renderer.draw_frame(frame_index)?;
            if tx.blocking_send(frame).is_err() {
                // Writer stopped; its error is reported instead.
                return Ok(());
            }
        }
        Ok(())
    });

    let mut written = 0u64;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => None,
            frame = rx.recv() => Some(frame),
        };
        let Some(frame) = next else {
            drop(rx);
            let _ = producer.await;
            return Err(KartlapError::cancelled("render canceled"));
        };
        let Some(frame) = frame else {
            break;
        };

        let write_result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = sink.write_all(&frame) => Some(result),
        };
        match write_result {
            None => {
                drop(rx);
                let _ = producer.await;
                return Err(KartlapError::cancelled("render canceled"));
            }
            Some(Err(e)) => {
                drop(rx);
                let _ = producer.await;
                return Err(KartlapError::render(format!(
                    "failed to write frame {written} to encoder: {e}"
                )));
            }
            Some(Ok(())) => written += 1,
        }
    }

    producer
        .await
        .map_err(|e| KartlapError::render(format!("frame producer panicked: {e}")))??;

    sink.shutdown()
        .await
        .map_err(|e| KartlapError::render(format!("failed to close encoder input: {e}")))?;

    if written != total_frames {
        return Err(KartlapError::render(format!(
            "streamed {written} of {total_frames} frames"
        )));
    }
    tracing::debug!(frames = written, "Frame stream complete");
    Ok(written)
}

/// Draw every frame into `dir` as `frame_000000.png`, ... and mark completion.
///
/// Returns the ffmpeg input pattern for the staged sequence.
pub async fn stage_frames_to_disk(
    renderer: Arc<FrameRenderer>,
    total_frames: u64,
    dir: &Path,
    cancel: &CancellationToken,
) -> KartlapResult<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let dir = dir.to_path_buf();
    let cancel = cancel.clone();

    tokio::task::spawn_blocking(move || -> KartlapResult<PathBuf> {
        for frame_index in 0..total_frames {
            if cancel.is_cancelled() {
                return Err(KartlapError::cancelled("render canceled"));
            }
            let frame = renderer.draw_frame(frame_index)?;
            std::fs::write(dir.join(format!("frame_{frame_index:06}.png")), frame.as_slice())?;
            if frame_index % 1000 == 0 {
                tracing::debug!(frame_index, total_frames, "Staging frames");
            }
        }
        std::fs::write(dir.join(STAGING_COMPLETE_MARKER), total_frames.to_string())?;
        Ok(dir.join(FRAME_PATTERN))
    })
    .await
    .map_err(|e| KartlapError::render(format!("frame staging panicked: {e}")))?
}

fn build_frame_renderer(ctx: &OverlayContext) -> KartlapResult<Arc<FrameRenderer>> {
    let font = ctx.style.resolve_font_path().ok_or_else(|| {
        KartlapError::render("raster overlay needs a font file; set render.font_path")
    })?;
    let painter = PngPanelPainter::new(&ctx.style, &ctx.options, &font, ctx.timeline.len())?;
    Ok(Arc::new(FrameRenderer::new(
        Arc::clone(&ctx.timeline),
        ctx.video.fps,
        ctx.start_offset_secs,
        Arc::new(painter),
    )?))
}

/// Pipe frames into each encoder attempt's stdin.
pub(crate) async fn render_streamed(
    ctx: &OverlayContext,
    channel_frames: usize,
) -> KartlapResult<(u64, EncoderPlan)> {
    let renderer = build_frame_renderer(ctx)?;
    let total_frames = ctx.video.total_frames();
    let (width, height) = renderer.panel_size();
    tracing::debug!(width, height, channel_frames, "Streaming overlay panels");
    let source = OverlaySource::PipedFrames;

    run_encoding_attempts(&ctx.plans, |plan| {
        let renderer = Arc::clone(&renderer);
        let source = source.clone();
        async move {
            let args = build_encode_args(ctx, &plan, &source);
            let mut process = FfmpegProcess::spawn(&ctx.ffmpeg_binary, &args, true, &plan.label)?;
            let stdin = process.take_stdin().ok_or_else(|| {
                KartlapError::encoding_attempt(&plan.label, "ffmpeg stdin not available", "")
            })?;

            let (streamed, encoded) = tokio::join!(
                stream_frames(renderer, total_frames, channel_frames, stdin, &ctx.cancel),
                process.wait(ctx.video.duration, total_frames, ctx.progress.clone(), &ctx.cancel),
            );
            // The encoder's own error explains a broken pipe better.
            encoded?;
            streamed
        }
    })
    .await
}

/// Stage all frames under the job's work dir, then encode once per attempt.
pub(crate) async fn render_from_disk(ctx: &OverlayContext) -> KartlapResult<(u64, EncoderPlan)> {
    let renderer = build_frame_renderer(ctx)?;
    let total_frames = ctx.video.total_frames();
    let (width, height) = renderer.panel_size();
    tracing::debug!(width, height, total_frames, "Staging overlay panels");
    let frames_dir = ctx.work_dir.join("frames");
    let pattern = stage_frames_to_disk(renderer, total_frames, &frames_dir, &ctx.cancel).await?;
    let source = OverlaySource::FrameSequence(pattern);

    let ((), plan) = run_encoding_attempts(&ctx.plans, |plan| {
        let source = source.clone();
        async move {
            let args = build_encode_args(ctx, &plan, &source);
            let process = FfmpegProcess::spawn(&ctx.ffmpeg_binary, &args, false, &plan.label)?;
            process
                .wait(ctx.video.duration, total_frames, ctx.progress.clone(), &ctx.cancel)
                .await
        }
    })
    .await?;

    Ok((total_frames, plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::raster::tests::renderer;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    const EXPECTED: &str = "-;-;Lap 1/2  P2@0.000;Lap 1/2  P2@0.250;Lap 1/2  P2@0.500;\
Lap 1/2  P2@0.750;Lap 2/2  P1@0.000;Lap 2/2  P1@0.250;Lap 2/2  P1@0.500;\
Lap 2/2  P1@0.750;Lap 2/2  P1@1.000;-;";

    #[tokio::test]
    async fn test_stream_preserves_order_under_backpressure() {
        let (writer, mut reader) = tokio::io::duplex(8);
        let cancel = CancellationToken::new();

        let consumer = tokio::spawn(async move {
            let mut out = Vec::new();
            let mut buf = [0u8; 3];
            loop {
                tokio::time::sleep(Duration::from_millis(1)).await;
                let n = reader.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            out
        });

        let written = stream_frames(Arc::new(renderer(0.5)), 12, 1, writer, &cancel)
            .await
            .unwrap();
        assert_eq!(written, 12);
        let out = consumer.await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), EXPECTED);
    }

    #[tokio::test]
    async fn test_stream_cancel_while_sink_full() {
        // Nobody reads: the writer blocks on a full pipe until canceled.
        let (writer, _reader) = tokio::io::duplex(4);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = stream_frames(Arc::new(renderer(0.0)), 1_000, 2, writer, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_stream_reports_closed_sink() {
        let (writer, reader) = tokio::io::duplex(4);
        drop(reader);
        let err = stream_frames(Arc::new(renderer(0.0)), 10, 2, writer, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KartlapError::Render { .. }));
    }

    #[tokio::test]
    async fn test_stage_frames_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames");
        let pattern = stage_frames_to_disk(
            Arc::new(renderer(0.5)),
            12,
            &frames,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(pattern, frames.join(FRAME_PATTERN));
        assert_eq!(std::fs::read(frames.join("frame_000000.png")).unwrap(), b"-;");
        assert_eq!(
            std::fs::read(frames.join("frame_000006.png")).unwrap(),
            b"Lap 2/2  P1@0.000;"
        );
        assert!(frames.join("frame_000011.png").exists());
        assert!(!frames.join("frame_000012.png").exists());
        assert_eq!(
            std::fs::read_to_string(frames.join(STAGING_COMPLETE_MARKER)).unwrap(),
            "12"
        );
    }

    #[tokio::test]
    async fn test_stage_frames_respects_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = stage_frames_to_disk(Arc::new(renderer(0.0)), 5, dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!dir.path().join(STAGING_COMPLETE_MARKER).exists());
    }
}
