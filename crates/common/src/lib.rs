//! KartLap Common Utilities
//!
//! Shared infrastructure for all KartLap crates:
//! - Error taxonomy and result alias
//! - Timestamp parsing and start-offset resolution
//! - Tracing/logging initialization
//! - Configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
