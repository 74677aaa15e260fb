//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directories the render pipeline writes scratch files into.
    pub temp_roots: Vec<PathBuf>,

    /// Render defaults.
    pub render: RenderDefaults,

    /// Temp-file retention policy.
    pub retention: RetentionConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Default render parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderDefaults {
    /// Try a hardware encoder before falling back to software.
    pub prefer_hardware: bool,

    /// Overlay strategy: `filter-graph`, `raster` or `raster-disk`.
    pub overlay_mode: String,

    /// libx264 preset for the software plan.
    pub software_preset: String,

    /// libx264 CRF for the software plan.
    pub software_crf: u8,

    /// Constant quality for hardware plans (qp / global_quality / cq).
    pub hardware_quality: u8,

    /// Font file used by both overlay strategies.
    pub font_path: Option<PathBuf>,

    /// Frames buffered between the raster producer and the encoder pipe.
    pub raster_channel_frames: usize,
}

/// Temp-file retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Files older than this are eligible for deletion.
    pub max_age_hours: u64,

    /// Where the cleanup schedule is persisted.
    pub schedule_path: PathBuf,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "kartlap_render_engine=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            temp_roots: vec![std::env::temp_dir().join("kartlap")],
            render: RenderDefaults::default(),
            retention: RetentionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RenderDefaults {
    fn default() -> Self {
        Self {
            prefer_hardware: true,
            overlay_mode: "filter-graph".to_string(),
            software_preset: "veryfast".to_string(),
            software_crf: 20,
            hardware_quality: 23,
            font_path: None,
            raster_channel_frames: 8,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_hours: 24,
            schedule_path: config_dir().join("cleanup-schedule.json"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl RetentionConfig {
    /// Retention window as a duration.
    pub fn max_age(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_age_hours.saturating_mul(3600))
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let config_path = config_file_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }
}

fn config_dir() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("kartlap")
}

/// Standard config file location.
fn config_file_path() -> PathBuf {
    config_dir().join("config.json")
}
