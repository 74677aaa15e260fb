//! Adapters for lap rows handed over by the storage layer.

use kartlap_common::error::{KartlapError, KartlapResult};
use serde::{Deserialize, Serialize};

use crate::lap::{Lap, PositionChange};

/// Event type carrying a live race position.
pub const POSITION_EVENT: &str = "position";

/// A persisted lap row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LapRecord {
    pub number: i64,
    #[serde(rename = "durationS")]
    pub duration_secs: f64,
}

/// A persisted event recorded during a lap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LapEventRecord {
    pub lap_number: i64,
    /// Seconds since the start of the lap.
    #[serde(rename = "offsetS")]
    pub offset_secs: f64,
    pub event_type: String,
    pub value: String,
}

/// Convert persisted lap and event rows into raw laps.
///
/// Only `position` events are used; other event types are ignored. The
/// lap's own position is the last position reported during it.
pub fn laps_from_records(laps: &[LapRecord], events: &[LapEventRecord]) -> KartlapResult<Vec<Lap>> {
    laps.iter()
        .enumerate()
        .map(|(row, record)| {
            let number = u32::try_from(record.number)
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| {
                    KartlapError::validation(format!(
                        "lap row {}: lap number must be >= 1, got {}",
                        row + 1,
                        record.number
                    ))
                })?;

            let changes: Vec<PositionChange> = events
                .iter()
                .filter(|event| event.lap_number == record.number)
                .filter(|event| event.event_type == POSITION_EVENT)
                .filter_map(|event| match event.value.trim().parse::<u32>() {
                    Ok(position) => Some(PositionChange::new(event.offset_secs, position)),
                    Err(_) => {
                        tracing::warn!(
                            lap = record.number,
                            value = %event.value,
                            "Ignoring position event with a non-numeric value"
                        );
                        None
                    }
                })
                .collect();

            let position = changes
                .iter()
                .filter(|c| c.at_secs.is_finite() && c.at_secs >= 0.0)
                .max_by(|a, b| a.at_secs.total_cmp(&b.at_secs))
                .map(|c| c.position)
                .unwrap_or(0);

            let mut lap = Lap::new(number, record.duration_secs);
            lap.position = position;
            lap.position_changes = changes;
            Ok(lap)
        })
        .collect()
}
