//! Error types for grabbox-core.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The link resolver failed or returned nothing usable. Fatal for
    /// the task; never retried here.
    #[error("link resolution failed: {0}")]
    Resolution(String),

    #[error("no mirror URL available for the file")]
    NoMirrorAvailable,

    /// Connection or timeout during a transfer session. Retried with
    /// backoff up to the restart cap.
    #[error("network error: {0}")]
    Network(String),

    /// Zero byte progress past the stall threshold, even after the
    /// parameter escalation ladder was exhausted.
    #[error("transfer stalled after {restarts} restarts")]
    StallTimeout { restarts: u32 },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The external engine's control channel is unreachable. Triggers
    /// fallback to the direct engine; never marks a task failed.
    #[error("external engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("destination already claimed by another task: {}", .0.display())]
    DestinationCollision(PathBuf),

    #[error("file I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<grabbox_resolve::ResolveError> for CoreError {
    fn from(e: grabbox_resolve::ResolveError) -> Self {
        match e {
            grabbox_resolve::ResolveError::NoMirrors(_) => CoreError::NoMirrorAvailable,
            other => CoreError::Resolution(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
