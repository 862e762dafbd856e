//! Error types for the snapshot engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::vcs::VcsError;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while starting, querying or stopping the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Watched directory does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The platform watcher could not be set up.
    #[error("File watcher error: {0}")]
    Watch(String),

    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History cache error: {0}")]
    Cache(#[from] serde_json::Error),

    #[error("Path is outside the watched tree: {0}")]
    OutsideTree(PathBuf),

    /// The engine shut down before the request completed.
    #[error("Engine has shut down")]
    Stopped,
}

/// Why a restore request did not complete.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// The target snapshot no longer resolves; nothing was written.
    #[error("Snapshot {commit} cannot be resolved")]
    Unresolvable { commit: String },

    /// Cancelled before the pre-restore snapshot; nothing was written.
    #[error("Restore was cancelled")]
    Cancelled,

    /// The current state could not be saved first; nothing was written.
    #[error("Could not record the pre-restore snapshot: {0}")]
    PreRestoreFailed(#[source] VcsError),

    #[error("Path is outside the watched tree: {0}")]
    OutsideTree(PathBuf),

    /// Writing restored content failed part way.
    #[error("Restore of {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),

    #[error("Engine has shut down")]
    Stopped,
}
