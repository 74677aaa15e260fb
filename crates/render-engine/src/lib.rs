//! KartLap Render Engine
//!
//! Burns a lap-timer panel into kart session video and encodes the result,
//! trying a hardware encoder first and falling back to libx264.
//!
//! # Pipeline Architecture
//!
//! ```text
//! laps.txt ──► SessionTimeline ──┬── chapter markers ──────────────┐
//!                                │                                 │
//!                                ├── drawtext graph (filter-graph) ├──► ffmpeg ──► output.mp4
//!                                │                                 │      ▲
//! session.mp4 ───────────────────┴── PNG panels (raster) ──────────┘      │
//!                                      stdin pipe / frame dir             │
//!                                                                          │
//!                                   encoder plans: [vaapi|qsv|nvenc], x264 ┘
//! ```

pub mod combine;
pub mod compositor;
pub mod encoder;
pub mod export;
pub mod ffmpeg;
pub mod overlay;
pub mod probe;

pub use export::*;
