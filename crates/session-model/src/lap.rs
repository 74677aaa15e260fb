//! Lap and live-position types.

use serde::{Deserialize, Serialize};

/// A live position sample inside a lap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionChange {
    /// Seconds since the start of the lap.
    #[serde(rename = "atS")]
    pub at_secs: f64,

    /// Race position; 0 means unknown.
    pub position: u32,
}

impl PositionChange {
    pub fn new(at_secs: f64, position: u32) -> Self {
        Self { at_secs, position }
    }
}

/// One completed circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lap {
    /// 1-based lap number.
    pub number: u32,

    /// Lap duration in seconds.
    #[serde(rename = "durationS")]
    pub duration_secs: f64,

    /// Session time at which the lap starts. Derived, never trusted from input.
    #[serde(rename = "startS", default)]
    pub start_secs: f64,

    /// Position at the end of the lap; 0 means unknown.
    #[serde(default)]
    pub position: u32,

    /// Position samples during the lap.
    #[serde(rename = "positionChanges", default)]
    pub position_changes: Vec<PositionChange>,
}

impl Lap {
    /// Create a lap with no position information.
    pub fn new(number: u32, duration_secs: f64) -> Self {
        Self {
            number,
            duration_secs,
            start_secs: 0.0,
            position: 0,
            position_changes: Vec::new(),
        }
    }

    /// Attach a single known position sampled at the start of the lap.
    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self.position_changes = if position > 0 {
            vec![PositionChange::new(0.0, position)]
        } else {
            Vec::new()
        };
        self
    }

    /// Session time at which this lap ends.
    pub fn end_secs(&self) -> f64 {
        self.start_secs + self.duration_secs
    }

    /// Position in effect `lap_elapsed` seconds into the lap (0 = unknown).
    ///
    /// Expects normalized position changes.
    pub fn position_at(&self, lap_elapsed: f64) -> u32 {
        if self.position_changes.is_empty() {
            return self.position;
        }
        let idx = self
            .position_changes
            .partition_point(|change| change.at_secs <= lap_elapsed);
        if idx == 0 {
            0
        } else {
            self.position_changes[idx - 1].position
        }
    }
}

/// Normalize a lap's raw position samples.
///
/// - samples with a non-finite or negative `at_secs` are dropped
/// - `at_secs` is clamped to `[0, duration_secs]`
/// - samples are ordered by time, ties keep their input order and the
///   later one wins
/// - without any valid sample, `fallback > 0` becomes a single sample at 0
/// - an unknown-position sample is prepended when the first one is after 0
/// - consecutive samples with the same position are collapsed
pub fn normalize_position_changes(
    changes: &[PositionChange],
    duration_secs: f64,
    fallback: u32,
) -> Vec<PositionChange> {
    let upper = if duration_secs.is_finite() {
        duration_secs.max(0.0)
    } else {
        0.0
    };

    let mut valid: Vec<PositionChange> = changes
        .iter()
        .filter(|change| change.at_secs.is_finite() && change.at_secs >= 0.0)
        .map(|change| PositionChange::new(change.at_secs.min(upper), change.position))
        .collect();

    // Stable: equal timestamps keep their original relative order.
    valid.sort_by(|a, b| a.at_secs.total_cmp(&b.at_secs));

    if valid.is_empty() {
        return if fallback > 0 {
            vec![PositionChange::new(0.0, fallback)]
        } else {
            Vec::new()
        };
    }

    let mut by_time: Vec<PositionChange> = Vec::with_capacity(valid.len() + 1);
    for change in valid {
        match by_time.last_mut() {
            Some(last) if last.at_secs == change.at_secs => *last = change,
            _ => by_time.push(change),
        }
    }

    if by_time[0].at_secs > 0.0 {
        by_time.insert(0, PositionChange::new(0.0, 0));
    }

    by_time.dedup_by(|next, prev| next.position == prev.position);
    by_time
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changes(raw: &[(f64, u32)]) -> Vec<PositionChange> {
        raw.iter()
            .map(|(at, pos)| PositionChange::new(*at, *pos))
            .collect()
    }

    #[test]
    fn test_normalize_sorts_and_clamps() {
        let out = normalize_position_changes(&changes(&[(70.0, 3), (0.0, 5), (10.0, 4)]), 60.0, 0);
        assert_eq!(out, changes(&[(0.0, 5), (10.0, 4), (60.0, 3)]));
    }

    #[test]
    fn test_normalize_drops_invalid_samples() {
        let out = normalize_position_changes(
            &changes(&[(-1.0, 2), (f64::NAN, 7), (5.0, 3)]),
            60.0,
            0,
        );
        assert_eq!(out, changes(&[(0.0, 0), (5.0, 3)]));
    }

    #[test]
    fn test_normalize_uses_fallback_without_samples() {
        assert_eq!(
            normalize_position_changes(&[], 60.0, 4),
            changes(&[(0.0, 4)])
        );
        assert!(normalize_position_changes(&[], 60.0, 0).is_empty());
        assert_eq!(
            normalize_position_changes(&changes(&[(-3.0, 1)]), 60.0, 2),
            changes(&[(0.0, 2)])
        );
    }

    #[test]
    fn test_normalize_collapses_duplicates() {
        let out = normalize_position_changes(
            &changes(&[(0.0, 3), (10.0, 3), (20.0, 2), (30.0, 2), (40.0, 3)]),
            60.0,
            0,
        );
        assert_eq!(out, changes(&[(0.0, 3), (20.0, 2), (40.0, 3)]));
    }

    #[test]
    fn test_normalize_same_time_last_wins() {
        let out = normalize_position_changes(&changes(&[(5.0, 3), (5.0, 2)]), 60.0, 0);
        assert_eq!(out, changes(&[(0.0, 0), (5.0, 2)]));
    }

    #[test]
    fn test_position_at() {
        let mut lap = Lap::new(1, 60.0);
        lap.position_changes = changes(&[(0.0, 0), (12.0, 4), (40.0, 3)]);
        assert_eq!(lap.position_at(0.0), 0);
        assert_eq!(lap.position_at(12.0), 4);
        assert_eq!(lap.position_at(39.9), 4);
        assert_eq!(lap.position_at(59.0), 3);
    }

    #[test]
    fn test_with_position() {
        let lap = Lap::new(1, 57.755).with_position(11);
        assert_eq!(lap.position_changes, changes(&[(0.0, 11)]));
        assert!(Lap::new(2, 50.0).with_position(0).position_changes.is_empty());
    }
}
