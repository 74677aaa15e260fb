//! Write the per-lap chapter file for a lap-times file.

use std::path::PathBuf;

use kartlap_common::clock::parse_timestamp;
use kartlap_session_model::chapters::{
    build_chapter_markers, build_chapter_metadata_file, write_chapter_file,
    DEFAULT_CHAPTER_OFFSET_MS,
};
use kartlap_session_model::timeline::SessionTimeline;

pub fn run(
    laps: PathBuf,
    format: Option<String>,
    driver: Option<String>,
    start_time: String,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let timeline = SessionTimeline::normalize(super::load_laps(
        &laps,
        format.as_deref(),
        driver.as_deref(),
    )?)?;
    let offset = parse_timestamp(&start_time)?;
    let markers = build_chapter_markers(timeline.laps(), offset, None);

    match output {
        Some(path) => {
            write_chapter_file(&path, &markers)?;
            println!("Wrote {} chapters to {}", markers.len(), path.display());
        }
        None => print!(
            "{}",
            build_chapter_metadata_file(&markers, DEFAULT_CHAPTER_OFFSET_MS)
        ),
    }

    Ok(())
}
