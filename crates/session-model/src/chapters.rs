//! Per-lap chapter markers and the FFMETADATA chapter document.

use std::path::Path;

use kartlap_common::error::KartlapResult;
use serde::{Deserialize, Serialize};

use crate::lap::Lap;

/// End of the last chapter when the video is shorter or its length unknown.
///
/// Far beyond any session recording, so the final lap always runs to EOF.
pub const CHAPTER_END_SENTINEL_MS: u64 = 24 * 60 * 60 * 1000;

/// Shift applied to every boundary when serializing.
///
/// Seeking to a chapter lands one second before the kart crosses the line.
pub const DEFAULT_CHAPTER_OFFSET_MS: i64 = -1000;

pub const FFMETADATA_HEADER: &str = ";FFMETADATA1";

/// A named range of the output video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterMarker {
    pub start_ms: u64,
    pub end_ms: u64,
    pub title: String,
}

/// One marker per lap, in video time.
///
/// `lap_one_offset_secs` is the video time at which lap 1 starts.
pub fn build_chapter_markers(
    laps: &[Lap],
    lap_one_offset_secs: f64,
    video_duration_ms: Option<u64>,
) -> Vec<ChapterMarker> {
    let mut ordered: Vec<&Lap> = laps.iter().collect();
    ordered.sort_by(|a, b| {
        a.start_secs
            .total_cmp(&b.start_secs)
            .then(a.number.cmp(&b.number))
    });

    let offset_ms = if lap_one_offset_secs.is_finite() {
        (lap_one_offset_secs * 1000.0).round() as i64
    } else {
        0
    };

    // Laps floored at zero still get one millisecond each, so every marker
    // ends where the next begins.
    let mut starts: Vec<u64> = Vec::with_capacity(ordered.len());
    for lap in &ordered {
        let floored = (offset_ms + (lap.start_secs * 1000.0).round() as i64).max(0) as u64;
        let start = match starts.last() {
            Some(prev) => floored.max(prev + 1),
            None => floored,
        };
        starts.push(start);
    }

    let last_end = video_duration_ms
        .unwrap_or(0)
        .max(CHAPTER_END_SENTINEL_MS);

    ordered
        .iter()
        .enumerate()
        .map(|(i, lap)| {
            let start_ms = starts[i];
            let end_ms = starts.get(i + 1).copied().unwrap_or(last_end);
            ChapterMarker {
                start_ms,
                end_ms: end_ms.max(start_ms + 1),
                title: format!("Lap {}", lap.number),
            }
        })
        .collect()
}

/// Serialize markers as an FFMETADATA document, shifting boundaries by
/// `offset_ms` (see [`DEFAULT_CHAPTER_OFFSET_MS`]).
pub fn build_chapter_metadata_file(markers: &[ChapterMarker], offset_ms: i64) -> String {
    let mut doc = String::from(FFMETADATA_HEADER);
    doc.push('\n');

    for marker in markers {
        let start = (marker.start_ms as i64 + offset_ms).max(0);
        let end = (marker.end_ms as i64 + offset_ms).max(start + 1);
        doc.push_str(&format!(
            "[CHAPTER]\nTIMEBASE=1/1000\nSTART={start}\nEND={end}\ntitle={}\n",
            escape_metadata_value(&marker.title)
        ));
    }

    doc
}

/// Write the chapter document for `markers` to `path`.
pub fn write_chapter_file(path: &Path, markers: &[ChapterMarker]) -> KartlapResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        build_chapter_metadata_file(markers, DEFAULT_CHAPTER_OFFSET_MS),
    )?;
    Ok(())
}

fn escape_metadata_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '=' | ';' | '#' | '\\' | '\n') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
