//! Error types shared across KartLap crates.

use std::path::PathBuf;

/// Top-level error type for KartLap operations.
#[derive(Debug, thiserror::Error)]
pub enum KartlapError {
    /// Malformed lap or time input. Nothing is persisted.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// A lap export file could not be parsed.
    #[error("Parse error at line {line}: {message}")]
    FormatParse { line: usize, message: String },

    /// One encoder attempt failed.
    #[error("Encoding with {backend} failed: {message}")]
    EncodingAttempt {
        backend: String,
        message: String,
        /// Tail of the encoder's diagnostic output.
        diagnostics: String,
    },

    /// The render was canceled explicitly.
    #[error("Canceled: {message}")]
    Cancelled { message: String },

    #[error("Cleanup of {path} failed: {message}")]
    ResourceCleanup { path: PathBuf, message: String },

    #[error("Hardware probe error: {message}")]
    Probe { message: String },

    #[error("Render error: {message}")]
    Render { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using KartlapError.
pub type KartlapResult<T> = Result<T, KartlapError>;

impl KartlapError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn format_parse(line: usize, msg: impl Into<String>) -> Self {
        Self::FormatParse {
            line,
            message: msg.into(),
        }
    }

    pub fn encoding_attempt(
        backend: impl Into<String>,
        msg: impl Into<String>,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self::EncodingAttempt {
            backend: backend.into(),
            message: msg.into(),
            diagnostics: diagnostics.into(),
        }
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled {
            message: msg.into(),
        }
    }

    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe {
            message: msg.into(),
        }
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether this error came from an explicit cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Diagnostic output attached to an encoder failure, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::EncodingAttempt { diagnostics, .. } if !diagnostics.is_empty() => {
                Some(diagnostics)
            }
            _ => None,
        }
    }
}
