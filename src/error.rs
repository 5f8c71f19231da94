use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FilterError {
    #[error("remote listing unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("stream read failed after {partial} MS2 records: {message}")]
    StreamRead { partial: u64, message: String },

    #[error("format conversion failed: {0}")]
    Conversion(String),

    #[error("unsupported spectral format: {0}")]
    UnsupportedFormat(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("invalid assessment tier: {0}")]
    InvalidTier(String),

    #[error("invalid remote location: {0}")]
    InvalidRemoteLocation(String),

    #[error("invalid rule pattern {pattern}: {message}")]
    InvalidRule { pattern: String, message: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to parse study input: {0}")]
    InputParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),
}

impl FilterError {
    pub fn partial_count(&self) -> u64 {
        match self {
            FilterError::StreamRead { partial, .. } => *partial,
            _ => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FilterError::RemoteUnavailable(_) => "remote_unavailable",
            FilterError::StreamRead { .. } => "stream_read_error",
            FilterError::Conversion(_) | FilterError::MissingTool(_) => "conversion_error",
            FilterError::UnsupportedFormat(_) => "unsupported_format",
            _ => "internal_error",
        }
    }
}
