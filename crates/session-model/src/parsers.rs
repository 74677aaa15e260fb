//! Lap-timing export parsers.
//!
//! Two formats are supported:
//!
//! - **Daytona** fixed-line exports, one lap per line: `NN M:SS:mmm [POS]`.
//!   Any line that does not match aborts the whole parse.
//! - **Tabular** exports: a header row of driver names followed by one row
//!   per lap. Rows without a usable time for the selected driver are skipped.

use std::sync::OnceLock;

use kartlap_common::error::{KartlapError, KartlapResult};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::lap::Lap;
use crate::timeline::add_start_offsets;

/// Supported lap export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LapFormat {
    Daytona,
    Tabular,
}

impl std::str::FromStr for LapFormat {
    type Err = KartlapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daytona" => Ok(Self::Daytona),
            "tabular" | "table" | "csv" => Ok(Self::Tabular),
            other => Err(KartlapError::validation(format!(
                "unknown lap format `{other}` (expected daytona or tabular)"
            ))),
        }
    }
}

fn daytona_line() -> &'static Regex {
    static LINE: OnceLock<Regex> = OnceLock::new();
    LINE.get_or_init(|| {
        Regex::new(r"^(\d+)\s+(\d+):(\d{2}):(\d{3})(?:\s+\[(\d+)\])?$")
            .expect("daytona line pattern is valid")
    })
}

fn is_skippable(line: &str) -> bool {
    line.is_empty() || line.starts_with('#')
}

/// Guess the format from the first meaningful line.
pub fn detect_format(content: &str) -> LapFormat {
    content
        .lines()
        .map(str::trim)
        .find(|line| !is_skippable(line))
        .map(|line| {
            if daytona_line().is_match(line) {
                LapFormat::Daytona
            } else {
                LapFormat::Tabular
            }
        })
        .unwrap_or(LapFormat::Daytona)
}

/// Parse laps in the given format. `driver` is required for tabular files.
pub fn parse_laps(format: LapFormat, content: &str, driver: Option<&str>) -> KartlapResult<Vec<Lap>> {
    match format {
        LapFormat::Daytona => parse_daytona(content),
        LapFormat::Tabular => {
            let driver = driver
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| {
                    KartlapError::validation("a driver name is required for tabular lap files")
                })?;
            parse_tabular(content, driver)
        }
    }
}

/// Parse a Daytona fixed-line export.
pub fn parse_daytona(content: &str) -> KartlapResult<Vec<Lap>> {
    let pattern = daytona_line();
    let mut laps = Vec::new();

    for (idx, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if is_skippable(line) {
            continue;
        }

        let caps = pattern.captures(line).ok_or_else(|| {
            KartlapError::format_parse(
                idx + 1,
                format!("expected `NN M:SS:mmm [POS]`, got `{line}`"),
            )
        })?;

        let field = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or("0");
        let number: u32 = parse_field(field(1), idx)?;
        let minutes: u32 = parse_field(field(2), idx)?;
        let seconds: u32 = parse_field(field(3), idx)?;
        let millis: u32 = parse_field(field(4), idx)?;
        let position: u32 = parse_field(field(5), idx)?;

        let duration_secs = minutes as f64 * 60.0 + seconds as f64 + millis as f64 / 1000.0;
        laps.push(Lap::new(number, duration_secs).with_position(position));
    }

    add_start_offsets(&mut laps);
    Ok(laps)
}

fn parse_field<T: std::str::FromStr>(raw: &str, idx: usize) -> KartlapResult<T> {
    raw.parse()
        .map_err(|_| KartlapError::format_parse(idx + 1, format!("number out of range: `{raw}`")))
}

/// Parse a tabular export for one driver (matched case-insensitively).
pub fn parse_tabular(content: &str, driver: &str) -> KartlapResult<Vec<Lap>> {
    let mut lines = content
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx, line.trim()))
        .filter(|(_, line)| !is_skippable(line));

    let (header_idx, header) = lines
        .next()
        .ok_or_else(|| KartlapError::format_parse(1, "tabular lap file has no header row"))?;

    let delimiter = detect_delimiter(header);
    let columns: Vec<&str> = split_row(header, delimiter);
    let wanted = driver.trim().to_lowercase();
    let column = columns
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, name)| name.to_lowercase() == wanted)
        .map(|(i, _)| i)
        .ok_or_else(|| {
            let candidates: Vec<&str> = columns
                .iter()
                .skip(1)
                .copied()
                .filter(|name| !name.is_empty())
                .collect();
            KartlapError::format_parse(
                header_idx + 1,
                format!(
                    "driver `{driver}` not found; available drivers: {}",
                    candidates.join(", ")
                ),
            )
        })?;

    let mut laps = Vec::new();
    for (idx, line) in lines {
        let cells = split_row(line, delimiter);
        let Some(number) = cells.first().and_then(|c| c.parse::<u32>().ok()) else {
            tracing::debug!(line = idx + 1, "Skipping tabular row without a lap number");
            continue;
        };
        let Some(duration_secs) = cells.get(column).and_then(|c| parse_lap_time(c)) else {
            tracing::debug!(line = idx + 1, lap = number, "Skipping tabular row without a time for driver");
            continue;
        };
        laps.push(Lap::new(number, duration_secs));
    }

    add_start_offsets(&mut laps);
    Ok(laps)
}

fn detect_delimiter(header: &str) -> Option<char> {
    ['\t', ';', ','].into_iter().find(|d| header.contains(*d))
}

fn split_row(line: &str, delimiter: Option<char>) -> Vec<&str> {
    match delimiter {
        Some(d) => line.split(d).map(str::trim).collect(),
        None => line.split_whitespace().collect(),
    }
}

/// Parse `SS.mmm`, `M:SS.mmm` or `M:SS:mmm` into seconds.
pub fn parse_lap_time(cell: &str) -> Option<f64> {
    let cell = cell.trim();
    let parts: Vec<&str> = cell.split(':').collect();
    let secs = match parts.as_slice() {
        [secs] => secs.parse::<f64>().ok()?,
        [minutes, secs] => minutes.parse::<u32>().ok()? as f64 * 60.0 + secs.parse::<f64>().ok()?,
        [minutes, secs, millis] if millis.len() == 3 => {
            minutes.parse::<u32>().ok()? as f64 * 60.0
                + secs.parse::<u32>().ok()? as f64
                + millis.parse::<u32>().ok()? as f64 / 1000.0
        }
        _ => return None,
    };
    (secs.is_finite() && secs > 0.0).then_some(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lap::PositionChange;

    #[test]
    fn test_daytona_line() {
        let laps = parse_daytona("01 0:57:755 [11]\n").unwrap();
        assert_eq!(laps.len(), 1);
        let lap = &laps[0];
        assert_eq!(lap.number, 1);
        assert!((lap.duration_secs - 57.755).abs() < 1e-9);
        assert_eq!(lap.position, 11);
        assert_eq!(lap.position_changes, vec![PositionChange::new(0.0, 11)]);
    }

    #[test]
    fn test_daytona_accumulates_starts_and_skips_comments() {
        let content = "# session export\n01 0:57:755 [11]\n\n02 1:01:200 [9]\n03 0:59:000\n";
        let laps = parse_daytona(content).unwrap();
        assert_eq!(laps.len(), 3);
        assert!((laps[1].start_secs - 57.755).abs() < 1e-9);
        assert!((laps[2].start_secs - (57.755 + 61.2)).abs() < 1e-9);
        assert_eq!(laps[2].position, 0);
        assert!(laps[2].position_changes.is_empty());
    }

    #[test]
    fn test_daytona_aborts_on_first_bad_line() {
        let err = parse_daytona("01 0:57:755 [11]\nlap two 58s\n03 0:59:000\n").unwrap_err();
        match err {
            KartlapError::FormatParse { line, message } => {
                assert_eq!(line, 2);
                assert!(message.contains("lap two 58s"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_tabular_driver_case_insensitive() {
        let content = "Lap\tAlice\tBob\n1\t1:02.500\t59.100\n2\t1:01.000\t58.900\n";
        let laps = parse_tabular(content, "  BOB ").unwrap();
        assert_eq!(laps.len(), 2);
        assert!((laps[0].duration_secs - 59.1).abs() < 1e-9);
        assert!((laps[1].start_secs - 59.1).abs() < 1e-9);
    }

    #[test]
    fn test_tabular_skips_rows_without_cell() {
        let content = "Lap,Alice,Bob\n1,1:02.500,59.100\n2,,58.900\n3,pit,\n4,1:00:250,58.000\n";
        let laps = parse_tabular(content, "alice").unwrap();
        let numbers: Vec<u32> = laps.iter().map(|l| l.number).collect();
        assert_eq!(numbers, vec![1, 4]);
        assert!((laps[1].duration_secs - 60.25).abs() < 1e-9);
    }

    #[test]
    fn test_tabular_missing_driver_names_candidates() {
        let err = parse_tabular("Lap;Alice;Bob\n1;60.0;61.0\n", "Carol").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("Carol"));
        assert!(text.contains("Alice, Bob"));
    }

    #[test]
    fn test_tabular_requires_driver() {
        assert!(matches!(
            parse_laps(LapFormat::Tabular, "Lap\tA\n1\t60.0\n", Some(" ")),
            Err(KartlapError::Validation { .. })
        ));
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format("# hi\n01 0:57:755 [11]\n"), LapFormat::Daytona);
        assert_eq!(detect_format("Lap,Alice\n1,60.0\n"), LapFormat::Tabular);
    }

    #[test]
    fn test_parse_lap_time() {
        assert_eq!(parse_lap_time("57.5"), Some(57.5));
        assert_eq!(parse_lap_time("1:02.5"), Some(62.5));
        assert_eq!(parse_lap_time("1:02:500"), Some(62.5));
        assert_eq!(parse_lap_time(""), None);
        assert_eq!(parse_lap_time("0"), None);
        assert_eq!(parse_lap_time("DNF"), None);
    }

    #[test]
    fn test_lap_format_from_str() {
        assert_eq!("Daytona".parse::<LapFormat>().unwrap(), LapFormat::Daytona);
        assert_eq!("csv".parse::<LapFormat>().unwrap(), LapFormat::Tabular);
        assert!("xml".parse::<LapFormat>().is_err());
    }
}
