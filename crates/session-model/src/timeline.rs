//! Session timeline: laps laid end to end in session time.

use kartlap_common::error::{KartlapError, KartlapResult};
use serde::Serialize;

use crate::lap::{normalize_position_changes, Lap};

/// Tolerance applied at the very end of the session.
pub const END_OF_SESSION_EPSILON_SECS: f64 = 1e-3;

/// Laps ordered by number with contiguous `[start, start + duration)` ranges.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionTimeline {
    laps: Vec<Lap>,
}

/// The lap active at a session instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LapAtTime<'a> {
    /// Index into [`SessionTimeline::laps`].
    pub index: usize,
    pub lap: &'a Lap,
    /// Seconds since the lap started, within `[0, lap.duration_secs]`.
    pub lap_elapsed: f64,
}

impl<'a> LapAtTime<'a> {
    /// Position in effect at this instant (0 = unknown).
    pub fn position(&self) -> u32 {
        self.lap.position_at(self.lap_elapsed)
    }
}

impl SessionTimeline {
    /// Validate and normalize raw laps.
    ///
    /// The whole batch is rejected if any row has a lap number below 1 or a
    /// duration that is not a finite positive number.
    pub fn normalize(raw_laps: Vec<Lap>) -> KartlapResult<Self> {
        for (row, lap) in raw_laps.iter().enumerate() {
            if lap.number < 1 {
                return Err(KartlapError::validation(format!(
                    "lap row {}: lap number must be >= 1, got {}",
                    row + 1,
                    lap.number
                )));
            }
            if !lap.duration_secs.is_finite() || lap.duration_secs <= 0.0 {
                return Err(KartlapError::validation(format!(
                    "lap row {} (lap {}): duration must be a positive number of seconds, got {}",
                    row + 1,
                    lap.number,
                    lap.duration_secs
                )));
            }
        }

        let mut laps = raw_laps;
        laps.sort_by_key(|lap| lap.number);
        for lap in &mut laps {
            lap.position_changes =
                normalize_position_changes(&lap.position_changes, lap.duration_secs, lap.position);
        }
        add_start_offsets(&mut laps);

        Ok(Self { laps })
    }

    /// Laps in session order.
    pub fn laps(&self) -> &[Lap] {
        &self.laps
    }

    pub fn is_empty(&self) -> bool {
        self.laps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.laps.len()
    }

    /// Session length in seconds (end of the last lap).
    pub fn total_secs(&self) -> f64 {
        self.laps.last().map(Lap::end_secs).unwrap_or(0.0)
    }

    /// The lap active at session time `t`.
    ///
    /// Returns `None` before the session or after its end. The exact end
    /// (within [`END_OF_SESSION_EPSILON_SECS`]) maps to the final instant of
    /// the last lap.
    pub fn lap_for_session_time(&self, t: f64) -> Option<LapAtTime<'_>> {
        let last = self.laps.last()?;
        let total = last.end_secs();
        if !t.is_finite() || t < 0.0 || t > total + END_OF_SESSION_EPSILON_SECS {
            return None;
        }

        if t >= total {
            return Some(LapAtTime {
                index: self.laps.len() - 1,
                lap: last,
                lap_elapsed: last.duration_secs,
            });
        }

        let index = self
            .laps
            .partition_point(|lap| lap.start_secs <= t)
            .saturating_sub(1);
        let lap = &self.laps[index];
        Some(LapAtTime {
            index,
            lap,
            lap_elapsed: (t - lap.start_secs).clamp(0.0, lap.duration_secs),
        })
    }

    /// Best/average lap statistics.
    pub fn stats(&self) -> Option<LapStats> {
        LapStats::from_laps(&self.laps)
    }
}

/// Running-sum start offsets for laps already ordered by lap number.
pub fn add_start_offsets(laps: &mut [Lap]) {
    let mut start = 0.0;
    for lap in laps.iter_mut() {
        lap.start_secs = start;
        start += lap.duration_secs;
    }
}

/// Best and average lap durations for delta displays.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LapStats {
    pub best_secs: f64,
    pub best_lap_number: u32,
    pub average_secs: f64,
}

impl LapStats {
    pub fn from_laps(laps: &[Lap]) -> Option<Self> {
        let best = laps
            .iter()
            .min_by(|a, b| a.duration_secs.total_cmp(&b.duration_secs))?;
        let average_secs =
            laps.iter().map(|lap| lap.duration_secs).sum::<f64>() / laps.len() as f64;
        Some(Self {
            best_secs: best.duration_secs,
            best_lap_number: best.number,
            average_secs,
        })
    }

    /// Positive when the lap was slower than the best lap.
    pub fn delta_to_best(&self, lap: &Lap) -> f64 {
        lap.duration_secs - self.best_secs
    }

    /// Positive when the lap was slower than the average lap.
    pub fn delta_to_average(&self, lap: &Lap) -> f64 {
        lap.duration_secs - self.average_secs
    }
}
