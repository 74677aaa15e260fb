//! KartLap Session Model
//!
//! Defines the core data contracts for a kart-track session:
//! - **Laps:** numbered laps with durations and live position samples
//! - **Timeline:** laps laid end to end in session time, with lookup
//! - **Parsers:** adapters for the supported lap-timing export formats
//! - **Chapters:** per-lap chapter markers and the FFMETADATA document
//! - **Recording:** video geometry and persisted render status
//!
//! Session time starts at zero when lap 1 begins. Video time is mapped
//! onto it with `kartlap_common::clock::session_time`.

pub mod chapters;
pub mod lap;
pub mod parsers;
pub mod recording;
pub mod records;
pub mod timeline;

pub use chapters::*;
pub use lap::*;
pub use parsers::*;
pub use recording::*;
pub use records::*;
pub use timeline::*;
