//! KartLap CLI: command-line interface for lap overlays and temp-file upkeep.
//!
//! Usage:
//!   kartlap render <VIDEO> <LAPS>    Burn the lap overlay into a session video
//!   kartlap chapters <LAPS>          Print or write the per-lap chapter file
//!   kartlap probe                    Show hardware encoder availability
//!   kartlap cleanup                  Sweep stale files from the temp roots
//!   kartlap temp-stats               Show temp root usage

use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};
use kartlap_common::clock::StartOffset;

mod commands;

#[derive(Parser)]
#[command(
    name = "kartlap",
    about = "Lap-timer overlays for kart session video",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where lap 1 starts in the video.
#[derive(Args)]
#[command(group(ArgGroup::new("start").required(true).args(["start_time", "start_frame"])))]
struct StartArgs {
    /// Video timestamp of the lap 1 start (SS, MM:SS or HH:MM:SS, optional .mmm)
    #[arg(long)]
    start_time: Option<String>,

    /// Video frame number of the lap 1 start
    #[arg(long)]
    start_frame: Option<u64>,
}

impl StartArgs {
    fn offset(&self) -> StartOffset {
        match (&self.start_time, self.start_frame) {
            (Some(time), _) => StartOffset::Timestamp(time.clone()),
            (None, Some(frame)) => StartOffset::Frame(frame),
            (None, None) => StartOffset::Seconds(0.0),
        }
    }
}

/// The lap-times file and how to read it.
#[derive(Args)]
struct LapArgs {
    /// Lap-times text file
    laps: PathBuf,

    /// Lap file format: daytona|tabular (detected when omitted)
    #[arg(long)]
    format: Option<String>,

    /// Driver column to read from a tabular file
    #[arg(long)]
    driver: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Burn the lap overlay into a session video
    Render {
        /// Source session video
        video: PathBuf,

        #[command(flatten)]
        laps: LapArgs,

        #[command(flatten)]
        start: StartArgs,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overlay strategy: filter-graph|raster|raster-disk
        #[arg(long)]
        mode: Option<String>,

        /// Skip hardware encoders and use libx264
        #[arg(long)]
        no_hardware: bool,

        /// Also show delta to best and average lap
        #[arg(long)]
        deltas: bool,

        /// Do not mux per-lap chapters
        #[arg(long)]
        no_chapters: bool,
    },

    /// Print or write the FFMETADATA chapter file for a lap file
    Chapters {
        #[command(flatten)]
        laps: LapArgs,

        /// Video time of the lap 1 start (SS, MM:SS or HH:MM:SS)
        #[arg(long, default_value = "0")]
        start_time: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show hardware encoder availability
    Probe {
        /// Ignore the cached result and probe again
        #[arg(long)]
        force: bool,
    },

    /// Remove stale files from the configured temp roots
    Cleanup {
        /// Retention window in hours (defaults to the configured value)
        #[arg(long)]
        max_age_hours: Option<u64>,
    },

    /// Show file counts and sizes of the temp roots
    TempStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = kartlap_common::config::AppConfig::load();

    // Initialize logging
    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    kartlap_common::logging::init_logging(&logging);

    match cli.command {
        Commands::Render {
            video,
            laps,
            start,
            output,
            mode,
            no_hardware,
            deltas,
            no_chapters,
        } => {
            commands::render::run(
                &config,
                commands::render::RenderArgs {
                    video,
                    laps: laps.laps,
                    format: laps.format,
                    driver: laps.driver,
                    start: start.offset(),
                    output,
                    mode,
                    prefer_hardware: !no_hardware,
                    deltas,
                    chapters: !no_chapters,
                },
            )
            .await
        }
        Commands::Chapters {
            laps,
            start_time,
            output,
        } => commands::chapters::run(laps.laps, laps.format, laps.driver, start_time, output),
        Commands::Probe { force } => commands::probe::run(force).await,
        Commands::Cleanup { max_age_hours } => commands::cleanup::run(&config, max_age_hours).await,
        Commands::TempStats => commands::temp_stats::run(&config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_time_and_frame_conflict() {
        let parsed = Cli::try_parse_from([
            "kartlap",
            "render",
            "session.mp4",
            "laps.txt",
            "--start-time",
            "1:02.5",
            "--start-frame",
            "100",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_start_is_required() {
        let parsed = Cli::try_parse_from(["kartlap", "render", "session.mp4", "laps.txt"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_start_frame_parses() {
        let cli = Cli::try_parse_from([
            "kartlap",
            "render",
            "session.mp4",
            "laps.txt",
            "--start-frame",
            "150",
            "--no-hardware",
        ])
        .unwrap();
        match cli.command {
            Commands::Render {
                start, no_hardware, ..
            } => {
                assert_eq!(start.offset(), StartOffset::Frame(150));
                assert!(no_hardware);
            }
            _ => panic!("expected render"),
        }
    }
}
