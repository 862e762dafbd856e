use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Kind of a single raw filesystem observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawEventKind {
    Created,
    Modified,
    Deleted,
    /// The event path is the destination; `from` is the old location.
    Renamed { from: PathBuf },
}

/// A single change observed under the watched root. Paths are relative to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: RawEventKind,
    pub timestamp: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(path: impl Into<PathBuf>, kind: RawEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Net effect of a change window on one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed { from: PathBuf },
}

impl ChangeKind {
    /// Derive the kind from whether the path existed before and after the window.
    /// `None` means the changes cancelled out.
    pub fn from_presence(before: bool, after: bool) -> Option<Self> {
        match (before, after) {
            (false, false) => None,
            (false, true) => Some(ChangeKind::Added),
            (true, true) => Some(ChangeKind::Modified),
            (true, false) => Some(ChangeKind::Deleted),
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            ChangeKind::Added => "Add",
            ChangeKind::Modified => "Modify",
            ChangeKind::Deleted => "Delete",
            ChangeKind::Renamed { .. } => "Rename",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl PathChange {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Every path the change touches, with its (existed before, exists after) presence.
    fn presence(&self) -> Vec<(PathBuf, bool, bool)> {
        match &self.kind {
            ChangeKind::Added => vec![(self.path.clone(), false, true)],
            ChangeKind::Modified => vec![(self.path.clone(), true, true)],
            ChangeKind::Deleted => vec![(self.path.clone(), true, false)],
            ChangeKind::Renamed { from } => vec![
                (from.clone(), true, false),
                (self.path.clone(), false, true),
            ],
        }
    }

    /// Paths a backend has to stage for this change.
    pub fn staged_paths(&self) -> Vec<&Path> {
        match &self.kind {
            ChangeKind::Renamed { from } => vec![from.as_path(), self.path.as_path()],
            _ => vec![self.path.as_path()],
        }
    }
}

/// A coalesced group of changes destined for one commit.
///
/// `touched` is never empty once a debounce window closes; `changes` holds the
/// net effect and may be empty when every change in the window cancelled out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub touched: BTreeSet<PathBuf>,
    pub changes: Vec<PathChange>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl ChangeSet {
    pub fn new(
        touched: BTreeSet<PathBuf>,
        mut changes: Vec<PathChange>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Self {
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            touched,
            changes,
            window_start,
            window_end,
        }
    }

    /// Build a change set directly from net changes, outside any debounce window.
    pub fn from_changes(changes: Vec<PathChange>) -> Self {
        let now = Utc::now();
        let touched = changes
            .iter()
            .flat_map(|c| c.staged_paths())
            .map(Path::to_path_buf)
            .collect();
        Self::new(touched, changes, now, now)
    }

    pub fn is_effectively_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn staged_paths(&self) -> Vec<PathBuf> {
        let paths: BTreeSet<PathBuf> = self
            .changes
            .iter()
            .flat_map(|c| c.staged_paths())
            .map(Path::to_path_buf)
            .collect();
        paths.into_iter().collect()
    }

    /// Merge a later change set into this one, keeping the net effect of both.
    pub fn absorb(self, later: ChangeSet) -> ChangeSet {
        let mut presence: BTreeMap<PathBuf, (bool, bool)> = BTreeMap::new();
        for change in &self.changes {
            for (path, before, after) in change.presence() {
                presence.insert(path, (before, after));
            }
        }
        let later_paths: BTreeSet<PathBuf> = later
            .changes
            .iter()
            .flat_map(|c| c.presence())
            .map(|(p, _, _)| p)
            .collect();
        let earlier_paths: BTreeSet<PathBuf> = presence.keys().cloned().collect();
        for change in &later.changes {
            for (path, before, after) in change.presence() {
                presence
                    .entry(path)
                    .and_modify(|state| state.1 = after)
                    .or_insert((before, after));
            }
        }

        // A rename survives the merge only if the other side never touched its endpoints.
        let renames = self
            .changes
            .iter()
            .filter_map(|c| rename_pair(c).map(|pair| (pair, &later_paths)))
            .chain(
                later
                    .changes
                    .iter()
                    .filter_map(|c| rename_pair(c).map(|pair| (pair, &earlier_paths))),
            )
            .filter(|((from, to), other)| !other.contains(from) && !other.contains(to))
            .map(|(pair, _)| pair)
            .collect();

        let mut touched = self.touched;
        touched.extend(later.touched);
        ChangeSet::new(
            touched,
            changes_from_presence(presence, renames),
            self.window_start.min(later.window_start),
            self.window_end.max(later.window_end),
        )
    }

    /// A copy of this change set with the given paths dropped.
    pub fn without(&self, paths: &BTreeSet<PathBuf>) -> ChangeSet {
        let changes = self
            .changes
            .iter()
            .filter(|c| c.staged_paths().iter().all(|p| !paths.contains(*p)))
            .cloned()
            .collect();
        let touched = self
            .touched
            .iter()
            .filter(|p| !paths.contains(*p))
            .cloned()
            .collect();
        ChangeSet::new(touched, changes, self.window_start, self.window_end)
    }

    /// Human readable one-line description, used as the commit subject.
    pub fn summary(&self) -> String {
        match self.changes.as_slice() {
            [] => "No changes".to_string(),
            [single] => match &single.kind {
                ChangeKind::Renamed { from } => {
                    format!("Rename {} to {}", from.display(), single.path.display())
                }
                kind => format!("{} {}", kind.verb(), single.path.display()),
            },
            [first, rest @ ..] => {
                let verb = first.kind.verb();
                if rest.iter().all(|c| c.kind.verb() == verb) {
                    format!("{} {} files", verb, self.changes.len())
                } else {
                    format!("Update {} files", self.changes.len())
                }
            }
        }
    }
}

fn rename_pair(change: &PathChange) -> Option<(PathBuf, PathBuf)> {
    match &change.kind {
        ChangeKind::Renamed { from } => Some((from.clone(), change.path.clone())),
        _ => None,
    }
}

/// Turn per-path presence into net changes, pairing up the given renames where
/// both endpoints still have the shape of a move.
pub(crate) fn changes_from_presence(
    mut presence: BTreeMap<PathBuf, (bool, bool)>,
    renames: Vec<(PathBuf, PathBuf)>,
) -> Vec<PathChange> {
    let mut changes = Vec::new();
    for (from, to) in renames {
        let moved_away = presence.get(&from) == Some(&(true, false));
        let moved_in = presence.get(&to) == Some(&(false, true));
        if from != to && moved_away && moved_in {
            presence.remove(&from);
            presence.remove(&to);
            changes.push(PathChange::new(to, ChangeKind::Renamed { from }));
        }
    }
    for (path, (before, after)) in presence {
        if let Some(kind) = ChangeKind::from_presence(before, after) {
            changes.push(PathChange::new(path, kind));
        }
    }
    changes
}

/// Opaque identifier of a commit in the version-control backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitRef(String);

fn commit_ref_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[0-9a-fA-F]{4,64}$").ok())
        .as_ref()
}

impl CommitRef {
    /// Parse a full or abbreviated hexadecimal commit id.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        commit_ref_pattern()
            .map_or(false, |pattern| pattern.is_match(s))
            .then(|| Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CommitRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("not a commit reference: {s:?}"))
    }
}

/// Why a snapshot was taken. Recorded in the commit message trailer so it
/// survives a history rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotKind {
    Initial,
    Auto,
    PreRestore,
    Restore,
}

impl SnapshotKind {
    pub const TRAILER_KEY: &'static str = "Snapshot-Kind";

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Initial => "initial",
            SnapshotKind::Auto => "auto",
            SnapshotKind::PreRestore => "pre-restore",
            SnapshotKind::Restore => "restore",
        }
    }

    /// Full commit message: subject line followed by the kind trailer.
    pub fn commit_message(&self, subject: &str) -> String {
        format!("{}\n\n{}: {}", subject, Self::TRAILER_KEY, self.as_str())
    }

    /// Recover the kind from a commit message body. Untagged commits count as `Auto`.
    pub fn from_message(message: &str) -> Self {
        let prefix = format!("{}:", Self::TRAILER_KEY);
        message
            .lines()
            .filter_map(|line| line.trim().strip_prefix(prefix.as_str()))
            .find_map(|value| match value.trim() {
                "initial" => Some(SnapshotKind::Initial),
                "auto" => Some(SnapshotKind::Auto),
                "pre-restore" => Some(SnapshotKind::PreRestore),
                "restore" => Some(SnapshotKind::Restore),
                _ => None,
            })
            .unwrap_or(SnapshotKind::Auto)
    }
}

/// An immutable, addressable point-in-time commit of the watched tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub commit: CommitRef,
    pub parent: Option<CommitRef>,
    pub timestamp: DateTime<Utc>,
    pub kind: SnapshotKind,
    /// Commit subject line.
    pub message: String,
    pub changes: Vec<PathChange>,
    /// Debounce window the snapshot covers, when it came from a live change set.
    #[serde(default)]
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl Snapshot {
    /// Every path the snapshot touches, including rename sources.
    pub fn paths(&self) -> Vec<PathBuf> {
        let paths: BTreeSet<PathBuf> = self
            .changes
            .iter()
            .flat_map(|c| c.staged_paths())
            .map(Path::to_path_buf)
            .collect();
        paths.into_iter().collect()
    }

    pub fn touches(&self, path: &Path) -> bool {
        self.changes
            .iter()
            .any(|c| c.staged_paths().iter().any(|p| *p == path))
    }
}

/// User-visible conditions raised by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum Condition {
    /// The watched root disappeared; emission is suspended until it returns.
    WatchUnavailable { root: PathBuf, reason: String },
    /// The watched root is back and has been re-synchronised.
    WatchRecovered { root: PathBuf },
    /// A change set could not be committed after every retry.
    SnapshotFailed {
        paths: Vec<PathBuf>,
        attempts: u32,
        error: String,
    },
    /// A restore target no longer resolves in the backend.
    SnapshotUnresolvable { commit: String, paths: Vec<PathBuf> },
    /// A pipeline queue grew beyond its high-water mark.
    Backpressure {
        queue: String,
        depth: usize,
        high_water_mark: usize,
    },
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::WatchUnavailable { root, reason } => {
                write!(f, "watch unavailable for {}: {}", root.display(), reason)
            }
            Condition::WatchRecovered { root } => write!(f, "watch recovered for {}", root.display()),
            Condition::SnapshotFailed {
                paths,
                attempts,
                error,
            } => write!(
                f,
                "snapshot of {} path(s) failed after {} attempt(s): {}",
                paths.len(),
                attempts,
                error
            ),
            Condition::SnapshotUnresolvable { commit, .. } => {
                write!(f, "snapshot {} no longer resolves", commit)
            }
            Condition::Backpressure {
                queue,
                depth,
                high_water_mark,
            } => write!(
                f,
                "{} queue is falling behind ({} queued, high-water mark {})",
                queue, depth, high_water_mark
            ),
        }
    }
}

/// Events delivered to subscribers of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    SnapshotCreated(Snapshot),
    Condition(Condition),
}

/// Default subscriber channel capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 1000;

/// Fan-out of engine events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("No subscribers for engine event");
        }
    }

    pub fn condition(&self, condition: Condition) {
        tracing::warn!("{}", condition);
        self.emit(EngineEvent::Condition(condition));
    }

    pub fn snapshot_created(&self, snapshot: Snapshot) {
        self.emit(EngineEvent::SnapshotCreated(snapshot));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod events_test;
