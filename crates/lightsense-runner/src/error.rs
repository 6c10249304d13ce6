//! Errors reported by the command-line tool.

use lightsense_device::{DeviceError, MeasurementError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no transport selected; use --port, --tcp or --simulate")]
    NoTransport,

    #[error("only one of --port, --tcp and --simulate may be given")]
    ConflictingTransports,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("measurement failed: {0}")]
    Measurement(#[from] MeasurementError),

    #[error("failed to install Ctrl-C handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("nothing to set; give --wavelength, --zero-error or --gain-error")]
    NothingToSet,
}

pub type RunnerResult<T> = Result<T, RunnerError>;
