//! Frame compositor: maps output frames onto the lap timeline.
//!
//! Frame `i` of the source video shows video time `i / fps`. Its session
//! time is `i / fps - start_offset_secs`; the panel is drawn only when that
//! falls inside `[0, total]`.

use kartlap_common::clock::{format_lap_time, session_time};
use kartlap_session_model::timeline::SessionTimeline;

use crate::overlay::{headline_text, OverlayOptions};

/// What the overlay panel shows on one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelContent {
    /// 1-based lap number.
    pub lap_number: u32,
    pub total_laps: usize,
    /// Position in effect; 0 draws nothing.
    pub position: u32,
    /// Seconds into the current lap.
    pub lap_elapsed: f64,
}

impl PanelContent {
    /// First panel line: `Lap N/Total  P<k>`.
    pub fn headline(&self) -> String {
        headline_text(
            self.lap_number,
            self.total_laps,
            self.position,
            &OverlayOptions::default(),
        )
    }

    /// Second panel line: elapsed lap time.
    pub fn elapsed_line(&self) -> String {
        format_lap_time(self.lap_elapsed)
    }
}

/// A single frame's composition instructions.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameComposition {
    /// Frame number.
    pub frame_index: u64,

    /// Session time in seconds (negative before lap 1).
    pub session_secs: f64,

    /// Panel to draw, or `None` for a blank frame.
    pub panel: Option<PanelContent>,
}

/// Number of frames streamed for a video of `duration_secs` at `fps`.
pub fn total_frames(duration_secs: f64, fps: f64) -> u64 {
    if !(duration_secs.is_finite() && fps.is_finite()) || duration_secs <= 0.0 || fps <= 0.0 {
        return 0;
    }
    (duration_secs * fps).floor() as u64
}

/// Session time shown by `frame_index`.
pub fn frame_session_time(frame_index: u64, fps: f64, start_offset_secs: f64) -> f64 {
    session_time(frame_index as f64 / fps, start_offset_secs)
}

/// Compute the composition for one frame.
pub fn compose_frame(
    timeline: &SessionTimeline,
    frame_index: u64,
    fps: f64,
    start_offset_secs: f64,
) -> FrameComposition {
    let session_secs = frame_session_time(frame_index, fps, start_offset_secs);
    let panel = if session_secs >= 0.0 && session_secs <= timeline.total_secs() {
        timeline
            .lap_for_session_time(session_secs)
            .map(|hit| PanelContent {
                lap_number: hit.lap.number,
                total_laps: timeline.len(),
                position: hit.position(),
                lap_elapsed: hit.lap_elapsed,
            })
    } else {
        None
    };

    FrameComposition {
        frame_index,
        session_secs,
        panel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kartlap_session_model::lap::Lap;

    fn timeline() -> SessionTimeline {
        SessionTimeline::normalize(vec![
            Lap::new(1, 60.0).with_position(2),
            Lap::new(2, 55.0).with_position(1),
        ])
        .unwrap()
    }

    #[test]
    fn test_total_frames_floors() {
        assert_eq!(total_frames(10.0, 29.97), 299);
        assert_eq!(total_frames(0.0, 30.0), 0);
        assert_eq!(total_frames(10.0, 0.0), 0);
    }

    #[test]
    fn test_frames_before_offset_are_blank() {
        let comp = compose_frame(&timeline(), 30, 30.0, 2.0);
        assert!((comp.session_secs + 1.0).abs() < 1e-9);
        assert!(comp.panel.is_none());
    }

    #[test]
    fn test_frame_inside_second_lap() {
        // video 67s, offset 2s -> session 65s -> lap 2, 5s in
        let comp = compose_frame(&timeline(), 67 * 30, 30.0, 2.0);
        let panel = comp.panel.unwrap();
        assert_eq!(panel.lap_number, 2);
        assert_eq!(panel.headline(), "Lap 2/2  P1");
        assert_eq!(panel.elapsed_line(), "0:05.000");
    }

    #[test]
    fn test_frames_after_session_are_blank() {
        let comp = compose_frame(&timeline(), 118 * 30, 30.0, 2.0);
        assert!(comp.panel.is_none());
    }

    #[test]
    fn test_headline_without_position() {
        let panel = PanelContent {
            lap_number: 3,
            total_laps: 12,
            position: 0,
            lap_elapsed: 0.0,
        };
        assert_eq!(panel.headline(), "Lap 3/12");
    }
}
