//! KartLap Render Service
//!
//! Long-lived side of rendering: one job per recording, status writes, and
//! the temp-file retention sweep with its schedule.

pub mod cleanup;
pub mod jobs;
pub mod schedule;
pub mod service;
pub mod status;

pub use cleanup::{
    cleanup_temp_directories, temp_directory_stats, ActivePathProvider, CleanupReport,
    StaticActivePaths, TempDirStats,
};
pub use jobs::{
    ActiveJobInfo, JobFailure, JobOutcome, RenderJobKind, RenderJobManager, RenderJobSpec,
    RenderOutput, SharedOutcome, CANCELED_MESSAGE,
};
pub use schedule::{CleanupSchedule, CleanupScheduler, RunNowResult};
pub use service::RenderService;
pub use status::{MemoryStatusStore, StatusStore};
