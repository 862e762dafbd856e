//! Version-control capability interface.
//!
//! The engine only needs a handful of operations from its backend: commit the
//! current on-disk content of some paths, read a file as of a commit, and walk
//! the log. Any backend that provides them can be swapped in.

pub mod git;
pub mod memory;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::events::{CommitRef, PathChange};

pub use git::GitCli;
pub use memory::MemoryVcs;

/// Result type for backend operations.
pub type VcsResult<T> = Result<T, VcsError>;

/// Errors reported by a version-control backend.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The backend executable could not be started.
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A backend command exited unsuccessfully.
    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    /// The paths handed to `commit` carry no change relative to HEAD.
    #[error("Nothing to commit")]
    NothingToCommit,

    #[error("Unknown revision: {0}")]
    UnknownRevision(String),

    /// Backend output could not be parsed.
    #[error("Unexpected output from {command}: {detail}")]
    Malformed { command: String, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl VcsError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// What a successful commit produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub commit: CommitRef,
    pub parent: Option<CommitRef>,
    pub timestamp: DateTime<Utc>,
    /// Changes as the backend recorded them, the same way `log` reports them.
    pub changes: Vec<PathChange>,
}

/// One commit as read back from the backend's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub commit: CommitRef,
    pub parent: Option<CommitRef>,
    pub timestamp: DateTime<Utc>,
    /// Full commit message, trailers included.
    pub message: String,
    pub changes: Vec<PathChange>,
}

impl LogEntry {
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or_default().trim()
    }
}

/// Operations the engine needs from a version-control system.
///
/// All paths are relative to the watched root. Implementations are blocking;
/// async callers go through `spawn_blocking`.
pub trait Vcs: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn root(&self) -> &Path;

    /// Make sure the root is under version control and has at least one
    /// commit. Returns the current head.
    fn ensure_initialized(&self) -> VcsResult<CommitRef>;

    fn head(&self) -> VcsResult<Option<CommitRef>>;

    /// Commit the current on-disk content of every path named by `changes`.
    ///
    /// Fails with [`VcsError::NothingToCommit`] when that content is already
    /// what HEAD holds.
    fn commit(&self, changes: &[PathChange], message: &str) -> VcsResult<CommitInfo>;

    /// Expand a possibly abbreviated reference. `None` when it does not name a commit.
    fn resolve(&self, commit: &CommitRef) -> VcsResult<Option<CommitRef>>;

    /// File content as of `commit`; `None` when the path did not exist there.
    fn read(&self, commit: &CommitRef, path: &Path) -> VcsResult<Option<Vec<u8>>>;

    fn list_files(&self, commit: &CommitRef) -> VcsResult<Vec<PathBuf>>;

    /// Every commit reachable from HEAD, oldest first.
    fn log(&self) -> VcsResult<Vec<LogEntry>>;

    /// Paths whose on-disk content differs from HEAD.
    fn dirty_paths(&self) -> VcsResult<Vec<PathBuf>>;

    /// Directory where the backend keeps its own metadata.
    fn metadata_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Whether commits keep rename records rather than a delete plus an add.
    fn supports_renames(&self) -> bool {
        false
    }
}

/// Run a blocking backend call on the blocking thread pool.
pub async fn blocking<T, F>(vcs: &Arc<dyn Vcs>, f: F) -> VcsResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Vcs) -> VcsResult<T> + Send + 'static,
{
    let vcs = vcs.clone();
    tokio::task::spawn_blocking(move || f(vcs.as_ref()))
        .await
        .map_err(|err| VcsError::backend(format!("backend task failed: {}", err)))?
}
