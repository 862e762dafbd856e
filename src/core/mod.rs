//! Core pipeline: watching, filtering, coalescing and the shared data model.

pub mod debounce;
pub mod events;
pub mod filter;
pub mod queue;
pub mod scan;
pub mod suppress;
pub mod watcher;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use debounce::{run_debounce_loop, Coalescer};
pub use events::{
    ChangeKind, ChangeSet, CommitRef, Condition, EngineEvent, EventBus, PathChange, RawEvent,
    RawEventKind, Snapshot, SnapshotKind,
};
pub use filter::FileFilter;
pub use queue::{monitored, MonitoredReceiver, MonitoredSender, QueueMonitor};
pub use suppress::Suppressions;
pub use watcher::{FileEventSource, WatchControl};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
