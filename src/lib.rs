pub mod cli;
pub mod config;
pub mod core;
pub mod diff;
pub mod engine;
pub mod error;
pub mod vcs;

pub use config::EngineConfig;
pub use core::events::*;
pub use engine::{
    CommitOutcome, EngineHandle, EngineStatus, FileVersion, HistoryIndex, RestoreOutcome,
    RestoreRequest, RestoreTarget, RestoreTicket, SnapshotEngine, VersionPreview,
};
pub use error::{EngineError, EngineResult, RestoreError};
pub use vcs::{GitCli, MemoryVcs, Vcs};
