pub mod chapters;
pub mod cleanup;
pub mod probe;
pub mod render;
pub mod temp_stats;

use std::path::Path;

use anyhow::Context;
use kartlap_session_model::lap::Lap;
use kartlap_session_model::parsers::{detect_format, parse_laps, LapFormat};

/// Read and parse a lap-times file.
pub fn load_laps(path: &Path, format: Option<&str>, driver: Option<&str>) -> anyhow::Result<Vec<Lap>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read lap file {}", path.display()))?;
    let format = match format {
        Some(raw) => raw.parse::<LapFormat>()?,
        None => detect_format(&content),
    };
    tracing::debug!(path = %path.display(), format = ?format, "Parsing lap file");
    Ok(parse_laps(format, &content, driver)?)
}
