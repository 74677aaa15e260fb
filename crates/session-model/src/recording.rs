//! Video geometry and persisted recording status.

use kartlap_common::error::{KartlapError, KartlapResult};
use serde::{Deserialize, Serialize};

/// Geometry and timing of a source video.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Duration in seconds.
    pub duration: f64,
}

impl VideoInfo {
    /// Check that every field is usable for rendering.
    pub fn validate(&self) -> KartlapResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(KartlapError::validation(format!(
                "video size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(KartlapError::validation(format!(
                "video fps must be positive, got {}",
                self.fps
            )));
        }
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(KartlapError::validation(format!(
                "video duration must be positive, got {}",
                self.duration
            )));
        }
        Ok(())
    }

    /// Number of whole frames in the video.
    pub fn total_frames(&self) -> u64 {
        (self.duration * self.fps).floor().max(0.0) as u64
    }

    pub fn duration_ms(&self) -> u64 {
        (self.duration * 1000.0).round().max(0.0) as u64
    }
}

/// Recording lifecycle state as seen by the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    PendingUpload,
    Processing,
    Ready,
    Failed,
}

impl RecordingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingUpload => "pending_upload",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

/// A status write for one recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: RecordingStatus,
    /// Percent complete, 0-100.
    pub progress: u8,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
}

impl StatusUpdate {
    pub fn processing(progress: u8) -> Self {
        Self {
            status: RecordingStatus::Processing,
            progress: progress.min(100),
            error: None,
            size_bytes: None,
            fps: None,
        }
    }

    pub fn ready(size_bytes: u64, fps: Option<f64>) -> Self {
        Self {
            status: RecordingStatus::Ready,
            progress: 100,
            error: None,
            size_bytes: Some(size_bytes),
            fps,
        }
    }

    /// A terminal failure; progress is reset.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RecordingStatus::Failed,
            progress: 0,
            error: Some(error.into()),
            size_bytes: None,
            fps: None,
        }
    }
}
