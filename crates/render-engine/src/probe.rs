//! Source media inspection via ffprobe.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use kartlap_common::error::{KartlapError, KartlapResult};
use kartlap_session_model::recording::VideoInfo;
use serde::Deserialize;

use crate::ffmpeg::run_capture;

const FFPROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether `binary` resolves on `PATH`.
pub fn command_exists(binary: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {binary} >/dev/null 2>&1"))
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Read geometry, frame rate and duration of the first video stream.
pub async fn probe_video(ffprobe: &str, path: &Path) -> KartlapResult<VideoInfo> {
    if !path.exists() {
        return Err(KartlapError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let path_arg = path.to_string_lossy();
    let output = run_capture(
        ffprobe,
        &[
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,avg_frame_rate,duration:format=duration",
            "-of",
            "json",
            &path_arg,
        ],
        FFPROBE_TIMEOUT,
    )
    .await?;

    let info = parse_ffprobe_output(&output)?;
    tracing::debug!(
        path = %path.display(),
        width = info.width,
        height = info.height,
        fps = info.fps,
        duration = info.duration,
        "Probed video"
    );
    Ok(info)
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse `ffprobe -of json` output into [`VideoInfo`].
pub fn parse_ffprobe_output(json: &str) -> KartlapResult<VideoInfo> {
    let parsed: ProbeOutput = serde_json::from_str(json)?;
    let stream = parsed
        .streams
        .first()
        .ok_or_else(|| KartlapError::probe("no video stream found"))?;

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .ok_or_else(|| KartlapError::probe("video stream has no usable frame rate"))?;

    // Container duration is more reliable than the stream's for mkv/webm.
    let duration = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(stream.duration.as_deref())
        .and_then(|d| d.trim().parse::<f64>().ok())
        .ok_or_else(|| KartlapError::probe("video duration unknown"))?;

    let info = VideoInfo {
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        fps,
        duration,
    };
    info.validate()?;
    Ok(info)
}

/// `30000/1001` or `30` to frames per second.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let value = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.001);
        assert_eq!(parse_frame_rate("60"), Some(60.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_parse_ffprobe_output() {
        let json = r#"{
            "programs": [],
            "streams": [{"width": 1920, "height": 1080, "r_frame_rate": "60/1", "avg_frame_rate": "30000/1001", "duration": "12.0"}],
            "format": {"duration": "612.480000"}
        }"#;
        let info = parse_ffprobe_output(json).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
        assert!((info.fps - 29.97).abs() < 0.001);
        assert!((info.duration - 612.48).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ffprobe_falls_back_to_stream_values() {
        let json = r#"{"streams": [{"width": 640, "height": 360, "r_frame_rate": "25/1", "avg_frame_rate": "0/0", "duration": "3.5"}]}"#;
        let info = parse_ffprobe_output(json).unwrap();
        assert_eq!(info.fps, 25.0);
        assert_eq!(info.duration, 3.5);
    }

    #[test]
    fn test_parse_ffprobe_without_stream() {
        let err = parse_ffprobe_output(r#"{"streams": []}"#).unwrap_err();
        assert!(matches!(err, KartlapError::Probe { .. }));
    }

    #[tokio::test]
    async fn test_probe_missing_file() {
        let err = probe_video("ffprobe", Path::new("/no/such/video.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, KartlapError::FileNotFound { .. }));
    }
}
