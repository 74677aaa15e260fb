//! Lap overlay strategies.
//!
//! [`OverlayRenderer`] is chosen once per job. The filter-graph variant
//! hands ffmpeg a drawtext graph and does no per-frame work; the raster
//! variants draw every frame as a PNG and feed it to ffmpeg either through
//! its stdin or from a staged frame directory.

pub mod filter_graph;
pub mod raster;
pub mod stream;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use kartlap_common::error::{KartlapError, KartlapResult};
use kartlap_session_model::recording::VideoInfo;
use kartlap_session_model::timeline::SessionTimeline;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::encoder::EncoderPlan;
use crate::ffmpeg::ProgressCallback;

pub use filter_graph::build_overlay_filter_graph;
pub use raster::{FrameRenderer, PanelPainter, PngPanelPainter};
pub use stream::{stage_frames_to_disk, stream_frames};

/// Fonts tried when none is configured.
const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
    "/System/Library/Fonts/Supplemental/Arial Bold.ttf",
    "C:\\Windows\\Fonts\\arialbd.ttf",
];

/// Visual style of the lap panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayStyle {
    pub font_path: Option<PathBuf>,
    pub font_size: u32,
    /// RGBA.
    pub text_color: [u8; 4],
    /// RGBA; alpha sets the panel opacity.
    pub box_color: [u8; 4],
    /// Distance from the top-left corner of the video.
    pub margin: u32,
    pub padding: u32,
    pub line_spacing: u32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            font_path: None,
            font_size: 36,
            text_color: [255, 255, 255, 255],
            box_color: [0, 0, 0, 160],
            margin: 24,
            padding: 14,
            line_spacing: 8,
        }
    }
}

impl OverlayStyle {
    pub fn line_height(&self) -> u32 {
        self.font_size + self.line_spacing
    }

    /// The configured font, or the first installed candidate.
    pub fn resolve_font_path(&self) -> Option<PathBuf> {
        resolve_font_path(self.font_path.as_deref())
    }
}

/// Which panel elements are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayOptions {
    /// Include the `/Total` part of the lap counter.
    pub show_lap_counter: bool,
    pub show_position: bool,
    pub show_lap_deltas: bool,
    pub show_current_lap_time: bool,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            show_lap_counter: true,
            show_position: true,
            show_lap_deltas: false,
            show_current_lap_time: true,
        }
    }
}

/// First panel line: `Lap N/Total  P<k>`, trimmed per `options`.
pub fn headline_text(
    lap_number: u32,
    total_laps: usize,
    position: u32,
    options: &OverlayOptions,
) -> String {
    let mut text = if options.show_lap_counter {
        format!("Lap {lap_number}/{total_laps}")
    } else {
        format!("Lap {lap_number}")
    };
    if options.show_position && position > 0 {
        text.push_str(&format!("  P{position}"));
    }
    text
}

/// Find a usable font file.
pub fn resolve_font_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "Configured font not found, trying defaults");
    }
    FONT_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
}

/// `0xRRGGBB@A` colour for ffmpeg filters.
pub fn ffmpeg_color(rgba: [u8; 4]) -> String {
    format!(
        "0x{:02X}{:02X}{:02X}@{:.2}",
        rgba[0],
        rgba[1],
        rgba[2],
        rgba[3] as f64 / 255.0
    )
}

/// Overlay strategy names as accepted by config and CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayMode {
    FilterGraph,
    Raster,
    RasterDisk,
}

impl FromStr for OverlayMode {
    type Err = KartlapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "filter-graph" | "filtergraph" | "text" => Ok(Self::FilterGraph),
            "raster" | "raster-stream" => Ok(Self::Raster),
            "raster-disk" | "disk" => Ok(Self::RasterDisk),
            other => Err(KartlapError::config(format!(
                "unknown overlay mode `{other}` (expected filter-graph, raster or raster-disk)"
            ))),
        }
    }
}

/// Everything a renderer needs for one job.
#[derive(Clone)]
pub struct OverlayContext {
    pub ffmpeg_binary: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Scratch directory owned by the job.
    pub work_dir: PathBuf,
    pub video: VideoInfo,
    pub timeline: Arc<SessionTimeline>,
    /// Video time (seconds) at which lap 1 starts.
    pub start_offset_secs: f64,
    pub style: OverlayStyle,
    pub options: OverlayOptions,
    pub plans: Vec<EncoderPlan>,
    /// FFMETADATA chapter file to mux, if any.
    pub chapters_path: Option<PathBuf>,
    pub progress: Option<ProgressCallback>,
    pub cancel: CancellationToken,
}

/// Result of a successful overlay render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodedOutputDescriptor {
    pub output_path: PathBuf,
    pub size_bytes: u64,
    /// Frames drawn on the host (0 for the filter-graph path).
    pub frames_streamed: u64,
    /// Label of the encoder plan that produced the file.
    pub encoder_label: String,
}

/// The overlay strategies.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayRenderer {
    /// drawtext graph evaluated by ffmpeg.
    FilterGraph,
    /// PNG frames piped to ffmpeg with backpressure.
    RasterStream { channel_frames: usize },
    /// PNG frames staged on disk, then encoded once.
    RasterDisk,
}

impl OverlayRenderer {
    pub fn from_mode(mode: OverlayMode, channel_frames: usize) -> Self {
        match mode {
            OverlayMode::FilterGraph => Self::FilterGraph,
            OverlayMode::Raster => Self::RasterStream {
                channel_frames: channel_frames.max(1),
            },
            OverlayMode::RasterDisk => Self::RasterDisk,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FilterGraph => "filter-graph",
            Self::RasterStream { .. } => "raster",
            Self::RasterDisk => "raster-disk",
        }
    }

    /// Render the overlaid video described by `ctx`.
    pub async fn render(&self, ctx: &OverlayContext) -> KartlapResult<EncodedOutputDescriptor> {
        ctx.video.validate()?;
        tracing::info!(
            renderer = self.name(),
            input = %ctx.input_path.display(),
            output = %ctx.output_path.display(),
            laps = ctx.timeline.len(),
            start_offset_secs = ctx.start_offset_secs,
            "Rendering lap overlay"
        );

        let (frames_streamed, plan) = match self {
            Self::FilterGraph => filter_graph::render(ctx).await?,
            Self::RasterStream { channel_frames } => stream::render_streamed(ctx, *channel_frames).await?,
            Self::RasterDisk => stream::render_from_disk(ctx).await?,
        };

        let size_bytes = tokio::fs::metadata(&ctx.output_path).await?.len();
        Ok(EncodedOutputDescriptor {
            output_path: ctx.output_path.clone(),
            size_bytes,
            frames_streamed,
            encoder_label: plan.label,
        })
    }
}
