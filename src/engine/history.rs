//! History Index: per-path snapshot sequences and time lookups.
//!
//! Snapshots are kept in insertion order, which is commit order. Each one
//! gets an ordering key equal to its timestamp clamped to the previous key,
//! so the keys never decrease and time lookups can binary search even when
//! the clock stepped backwards between commits.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::events::{ChangeKind, CommitRef, Snapshot, SnapshotKind};
use crate::error::EngineResult;
use crate::vcs::LogEntry;

const CACHE_VERSION: u32 = 1;

/// One version of a file, numbered from 1 (oldest).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub number: usize,
    pub path: PathBuf,
    pub change: ChangeKind,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryIndex {
    snapshots: Vec<Snapshot>,
    keys: Vec<DateTime<Utc>>,
    by_path: HashMap<PathBuf, Vec<usize>>,
    known: HashSet<CommitRef>,
}

#[derive(Serialize, Deserialize)]
struct HistoryCache {
    version: u32,
    head: Option<CommitRef>,
    snapshots: Vec<Snapshot>,
}

impl HistoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay snapshots in commit order. The same input always gives the same index.
    pub fn rebuild(snapshots: impl IntoIterator<Item = Snapshot>) -> Self {
        let mut index = Self::new();
        for snapshot in snapshots {
            index.record(snapshot);
        }
        index
    }

    /// Rebuild from the backend log (oldest first).
    pub fn from_log(entries: impl IntoIterator<Item = LogEntry>) -> Self {
        Self::rebuild(entries.into_iter().map(snapshot_from_log))
    }

    /// Append a snapshot. Returns `false` if it was already indexed.
    pub fn record(&mut self, snapshot: Snapshot) -> bool {
        if !self.known.insert(snapshot.commit.clone()) {
            return false;
        }
        let key = match self.keys.last() {
            Some(previous) if *previous > snapshot.timestamp => *previous,
            _ => snapshot.timestamp,
        };
        let position = self.snapshots.len();
        for path in snapshot.paths() {
            self.by_path.entry(path).or_default().push(position);
        }
        self.keys.push(key);
        self.snapshots.push(snapshot);
        true
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    pub fn contains(&self, commit: &CommitRef) -> bool {
        self.known.contains(commit)
    }

    pub fn get(&self, commit: &CommitRef) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.commit == *commit)
    }

    /// Every path that appears in the history.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.by_path.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Snapshots touching `path`, oldest first.
    pub fn history(&self, path: &Path) -> Vec<&Snapshot> {
        self.positions(path)
            .iter()
            .map(|&i| &self.snapshots[i])
            .collect()
    }

    /// Numbered versions of `path`, oldest first.
    pub fn versions(&self, path: &Path) -> Vec<FileVersion> {
        self.history(path)
            .into_iter()
            .enumerate()
            .map(|(i, snapshot)| FileVersion {
                number: i + 1,
                path: path.to_path_buf(),
                change: change_for(snapshot, path),
                snapshot: snapshot.clone(),
            })
            .collect()
    }

    /// Snapshots taken between `from` and `to`, both inclusive.
    pub fn in_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<&Snapshot> {
        if from > to {
            return Vec::new();
        }
        let start = self.keys.partition_point(|k| *k < from);
        let end = self.keys.partition_point(|k| *k <= to);
        self.snapshots[start..end].iter().collect()
    }

    /// The most recent snapshot taken at or before `at`.
    pub fn as_of(&self, at: DateTime<Utc>) -> Option<&Snapshot> {
        let end = self.keys.partition_point(|k| *k <= at);
        end.checked_sub(1).map(|i| &self.snapshots[i])
    }

    /// The most recent snapshot touching `path` at or before `at`.
    pub fn path_as_of(&self, path: &Path, at: DateTime<Utc>) -> Option<&Snapshot> {
        let positions = self.positions(path);
        let end = positions.partition_point(|&i| self.keys[i] <= at);
        end.checked_sub(1).map(|i| &self.snapshots[positions[i]])
    }

    /// Pre-restore snapshots, newest first.
    pub fn pre_restore_points(&self) -> Vec<&Snapshot> {
        self.snapshots
            .iter()
            .rev()
            .filter(|s| s.kind == SnapshotKind::PreRestore)
            .collect()
    }

    fn positions(&self, path: &Path) -> &[usize] {
        self.by_path.get(path).map(Vec::as_slice).unwrap_or_default()
    }

    /// Write the index as a cache tagged with the head it reflects.
    pub fn save(&self, file: &Path, head: Option<&CommitRef>) -> EngineResult<()> {
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        let cache = HistoryCache {
            version: CACHE_VERSION,
            head: head.cloned(),
            snapshots: self.snapshots.clone(),
        };
        let tmp = file.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&cache)?)?;
        fs::rename(&tmp, file)?;
        debug!(snapshots = self.len(), file = %file.display(), "Saved history cache");
        Ok(())
    }

    /// Load a cache written by [`Self::save`]. Returns `None` when the cache is
    /// missing, unreadable, from another format version or for another head;
    /// the caller then rebuilds from the backend.
    pub fn load(file: &Path, head: Option<&CommitRef>) -> Option<Self> {
        let bytes = fs::read(file).ok()?;
        let cache: HistoryCache = match serde_json::from_slice(&bytes) {
            Ok(cache) => cache,
            Err(err) => {
                warn!("Discarding unreadable history cache {}: {}", file.display(), err);
                return None;
            }
        };
        if cache.version != CACHE_VERSION || cache.head.as_ref() != head {
            debug!("History cache is stale");
            return None;
        }
        Some(Self::rebuild(cache.snapshots))
    }
}

pub fn snapshot_from_log(entry: LogEntry) -> Snapshot {
    Snapshot {
        kind: SnapshotKind::from_message(&entry.message),
        message: entry.subject().to_string(),
        commit: entry.commit,
        parent: entry.parent,
        timestamp: entry.timestamp,
        changes: entry.changes,
        window: None,
    }
}

fn change_for(snapshot: &Snapshot, path: &Path) -> ChangeKind {
    snapshot
        .changes
        .iter()
        .find_map(|c| {
            if c.path == path {
                Some(c.kind.clone())
            } else {
                match &c.kind {
                    ChangeKind::Renamed { from } if from == path => Some(ChangeKind::Deleted),
                    _ => None,
                }
            }
        })
        .unwrap_or(ChangeKind::Modified)
}
