//! Paths with changes that have not made it into a snapshot yet.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::events::ChangeSet;

/// A path whose last change failed to commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPath {
    pub path: PathBuf,
    /// When the path was first flagged.
    pub since: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: String,
}

/// Tracks failed change sets until a later commit covers them or the user
/// gives them up.
#[derive(Debug, Default)]
pub struct PendingTracker {
    paths: BTreeMap<PathBuf, PendingPath>,
    failed: Option<ChangeSet>,
    /// Paths of a failed change set that is being retried right now.
    in_flight: BTreeSet<PathBuf>,
    /// Paths given up while in flight; a failing retry must not flag them again.
    acknowledged: BTreeSet<PathBuf>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand over the failed change set so it can be merged into the next attempt.
    pub fn take_failed(&mut self) -> Option<ChangeSet> {
        let failed = self.failed.take()?;
        self.in_flight.extend(failed.staged_paths());
        Some(failed)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.is_some()
    }

    /// Keep a change set that exhausted its retries and flag its paths.
    /// Returns the flagged paths.
    pub fn record_failure(&mut self, change_set: ChangeSet, attempts: u32, error: &str) -> Vec<PathBuf> {
        for path in change_set.staged_paths() {
            self.in_flight.remove(&path);
        }
        let change_set = change_set.without(&self.acknowledged);
        self.acknowledged.retain(|p| self.in_flight.contains(p));
        if change_set.is_effectively_empty() {
            return Vec::new();
        }

        let now = Utc::now();
        let flagged = change_set.staged_paths();
        for path in &flagged {
            let entry = self.paths.entry(path.clone()).or_insert_with(|| PendingPath {
                path: path.clone(),
                since: now,
                attempts: 0,
                last_error: String::new(),
            });
            entry.attempts += attempts;
            entry.last_error = error.to_string();
        }

        self.failed = Some(match self.failed.take() {
            Some(earlier) => earlier.absorb(change_set),
            None => change_set,
        });
        flagged
    }

    /// Clear the flags of paths a successful commit (or no-op) covered.
    pub fn record_success<'a>(&mut self, paths: impl IntoIterator<Item = &'a PathBuf>) {
        for path in paths {
            self.paths.remove(path);
            self.in_flight.remove(path);
            self.acknowledged.remove(path);
        }
    }

    /// Give up on the given paths: drop their flags and their part of the
    /// failed change set. Returns the paths that were actually pending.
    pub fn acknowledge(&mut self, paths: &[PathBuf]) -> Vec<PathBuf> {
        let dropped: BTreeSet<PathBuf> = paths
            .iter()
            .filter(|p| self.paths.remove(*p).is_some())
            .cloned()
            .collect();
        self.acknowledged
            .extend(dropped.iter().filter(|p| self.in_flight.contains(*p)).cloned());

        if let Some(failed) = self.failed.take() {
            let remaining = failed.without(&dropped);
            if !remaining.is_effectively_empty() {
                self.failed = Some(remaining);
            }
        }
        dropped.into_iter().collect()
    }

    pub fn is_pending(&self, path: &std::path::Path) -> bool {
        self.paths.contains_key(path)
    }

    pub fn paths(&self) -> Vec<PendingPath> {
        self.paths.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
