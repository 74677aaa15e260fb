//! Timestamp parsing and video-time utilities.
//!
//! Session video and lap data are aligned through a single start offset:
//! the video time (seconds) at which the first lap begins. Everything
//! downstream converts with
//!
//! ```text
//! session_secs = video_secs - start_offset_secs
//! ```
//!
//! and never the other way around.

use crate::error::{KartlapError, KartlapResult};

/// How the caller expressed the first lap's start within the video.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOffset {
    /// A timestamp such as `1:23.456` or `00:01:23.456`.
    Timestamp(String),
    /// A zero-based frame number in the source video.
    Frame(u64),
    /// Seconds, already resolved.
    Seconds(f64),
}

impl StartOffset {
    /// Resolve the offset to seconds. Frame offsets need the source fps.
    pub fn resolve_secs(&self, fps: f64) -> KartlapResult<f64> {
        match self {
            Self::Timestamp(raw) => parse_timestamp(raw),
            Self::Frame(frame) => {
                if !fps.is_finite() || fps <= 0.0 {
                    return Err(KartlapError::validation(format!(
                        "cannot convert frame {frame} to seconds with fps {fps}"
                    )));
                }
                Ok(*frame as f64 / fps)
            }
            Self::Seconds(secs) => {
                if !secs.is_finite() || *secs < 0.0 {
                    return Err(KartlapError::validation(format!(
                        "start offset must be a non-negative number of seconds, got {secs}"
                    )));
                }
                Ok(*secs)
            }
        }
    }
}

/// Convert a video timestamp to session time.
pub fn session_time(video_secs: f64, start_offset_secs: f64) -> f64 {
    video_secs - start_offset_secs
}

/// Convert a session timestamp back to video time.
pub fn video_time(session_secs: f64, start_offset_secs: f64) -> f64 {
    session_secs + start_offset_secs
}

/// Parse `SS(.fff)`, `MM:SS(.fff)` or `HH:MM:SS(.fff)` into seconds.
pub fn parse_timestamp(raw: &str) -> KartlapResult<f64> {
    let trimmed = raw.trim();
    let invalid = || KartlapError::validation(format!("invalid timestamp `{raw}`"));
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() > 3 {
        return Err(invalid());
    }

    let (last, leading) = parts.split_last().ok_or_else(invalid)?;
    let secs: f64 = parse_unsigned_decimal(last).ok_or_else(invalid)?;
    if !leading.is_empty() && secs >= 60.0 {
        return Err(invalid());
    }

    let mut total = secs;
    let mut multiplier = 60.0;
    for (idx, part) in leading.iter().rev().enumerate() {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let value: f64 = part.parse().map_err(|_| invalid())?;
        // minutes must be < 60 when hours are present
        if idx == 0 && leading.len() == 2 && value >= 60.0 {
            return Err(invalid());
        }
        total += value * multiplier;
        multiplier *= 60.0;
    }

    Ok(total)
}

fn parse_unsigned_decimal(raw: &str) -> Option<f64> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    let value: f64 = raw.parse().ok()?;
    value.is_finite().then_some(value)
}

/// Format a duration as `M:SS.mmm` (lap-time style).
pub fn format_lap_time(secs: f64) -> String {
    let total_ms = (secs.max(0.0) * 1000.0).round() as u64;
    let minutes = total_ms / 60_000;
    let seconds = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;
    format!("{minutes}:{seconds:02}.{millis:03}")
}

/// Format a signed delta as `+S.mmm` / `-S.mmm`.
pub fn format_delta(secs: f64) -> String {
    let sign = if secs < 0.0 { '-' } else { '+' };
    format!("{sign}{:.3}", secs.abs())
}
