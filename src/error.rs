//! Error types for Stevedore

use std::path::PathBuf;
use thiserror::Error;

/// Result type for Stevedore operations
pub type Result<T> = std::result::Result<T, StevedoreError>;

/// Stevedore error types
///
/// Every variant carries enough context (image identifier, failing path,
/// directory name) to act on without re-running at higher verbosity. All
/// variants propagate as job-level failures; there is no retry at this layer.
#[derive(Error, Debug)]
pub enum StevedoreError {
    #[error("Container engine not available: {0}")]
    ToolUnavailable(String),

    #[error("Image resolution failed: {0}")]
    ImageResolution(String),

    #[error("Subprocess failed: `{command}` exited with status {status}")]
    Subprocess { command: String, status: i32 },

    #[error(
        "Input path {path} is not in the list of host paths mounted into the \
         container virtual machine named {machine}. Already mounted paths: {mounts:?}. \
         Add the missing share to the VM and retry."
    )]
    PathNotReachable {
        path: PathBuf,
        machine: String,
        mounts: Vec<String>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
