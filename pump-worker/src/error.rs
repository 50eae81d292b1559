use std::path::PathBuf;

use metrics_exporter_prometheus::BuildError;
use pump_common::error::PumpError;
use thiserror::Error;

/// Enumeration of errors that stop the worker process.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to read pump state from {path}: {error}")]
    StateRead {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("failed to write pump state to {path}: {error}")]
    StateWrite {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("pump state in {path} is not valid: {error}")]
    StateFormat {
        path: PathBuf,
        error: serde_json::Error,
    },
    #[error("invalid missing data pattern: {0}")]
    MissingDataPattern(#[from] regex::Error),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] BuildError),
    #[error("metrics server failed: {0}")]
    Serve(std::io::Error),
    #[error(transparent)]
    Pump(#[from] PumpError),
}
