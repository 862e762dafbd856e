//! Snapshot Committer: turns change sets into commits, one at a time.
//!
//! Every commit (and every restore) runs under the tree lock, so the working
//! directory is never touched by two operations at once.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::pending::PendingTracker;
use crate::config::CommitConfig;
use crate::core::events::{ChangeSet, Condition, EventBus, PathChange, Snapshot, SnapshotKind};
use crate::core::lock;
use crate::core::queue::MonitoredSender;
use crate::vcs::{self, Vcs, VcsError, VcsResult};

/// Proof that the caller holds the tree lock.
pub struct TreeGuard {
    _guard: OwnedMutexGuard<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(Snapshot),
    /// Nothing to record: the changes cancelled out or HEAD already has them.
    NoOp,
    /// Retries exhausted; the paths stay pending.
    Failed { attempts: u32, error: String },
}

pub struct SnapshotCommitter {
    vcs: Arc<dyn Vcs>,
    tree_lock: Arc<AsyncMutex<()>>,
    policy: CommitConfig,
    pending: Arc<Mutex<PendingTracker>>,
    bus: EventBus,
    snapshots: MonitoredSender<Snapshot>,
}

impl SnapshotCommitter {
    pub fn new(
        vcs: Arc<dyn Vcs>,
        policy: CommitConfig,
        bus: EventBus,
        snapshots: MonitoredSender<Snapshot>,
    ) -> Self {
        Self {
            vcs,
            tree_lock: Arc::new(AsyncMutex::new(())),
            policy,
            pending: Arc::new(Mutex::new(PendingTracker::new())),
            bus,
            snapshots,
        }
    }

    pub fn vcs(&self) -> &Arc<dyn Vcs> {
        &self.vcs
    }

    pub fn pending(&self) -> &Arc<Mutex<PendingTracker>> {
        &self.pending
    }

    pub async fn lock_tree(&self) -> TreeGuard {
        TreeGuard {
            _guard: self.tree_lock.clone().lock_owned().await,
        }
    }

    /// Commit a closed change set, retrying with exponential backoff.
    ///
    /// A change set that failed earlier is merged in first, so one success
    /// covers both.
    pub async fn commit_change_set(&self, change_set: ChangeSet) -> CommitOutcome {
        let change_set = match lock(&self.pending).take_failed() {
            Some(failed) => {
                debug!("Merging previously failed change set");
                failed.absorb(change_set)
            }
            None => change_set,
        };

        if change_set.is_effectively_empty() {
            debug!(touched = change_set.touched.len(), "Change set cancelled out");
            lock(&self.pending).record_success(change_set.touched.iter());
            return CommitOutcome::NoOp;
        }

        let subject = change_set.summary();
        let window = Some((change_set.window_start, change_set.window_end));
        let limit = self.policy.retry_limit.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = {
                let guard = self.lock_tree().await;
                self.commit_locked(
                    &guard,
                    change_set.changes.clone(),
                    SnapshotKind::Auto,
                    &subject,
                    window,
                )
                .await
            };

            match result {
                Ok(snapshot) => {
                    let covered = change_set.staged_paths();
                    let mut pending = lock(&self.pending);
                    pending.record_success(change_set.touched.iter());
                    pending.record_success(covered.iter());
                    drop(pending);
                    return match snapshot {
                        Some(snapshot) => CommitOutcome::Committed(snapshot),
                        None => {
                            debug!("Working tree already matches HEAD");
                            CommitOutcome::NoOp
                        }
                    };
                }
                Err(err) if attempt < limit => {
                    let delay = self.policy.backoff(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "Commit failed, retrying: {}", err);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    let error = err.to_string();
                    let paths = lock(&self.pending).record_failure(change_set, attempt, &error);
                    if paths.is_empty() {
                        debug!("Every failed path was acknowledged during the retry");
                    } else {
                        self.bus.condition(Condition::SnapshotFailed {
                            paths,
                            attempts: attempt,
                            error: error.clone(),
                        });
                    }
                    return CommitOutcome::Failed {
                        attempts: attempt,
                        error,
                    };
                }
            }
        }
    }

    /// Re-submit the failed change set now, without waiting for new changes.
    pub async fn retry_pending(&self) -> Option<CommitOutcome> {
        let failed = lock(&self.pending).take_failed()?;
        info!(paths = failed.staged_paths().len(), "Retrying pending changes");
        Some(self.commit_change_set(failed).await)
    }

    /// One commit attempt under an already held tree lock.
    ///
    /// Returns `None` when there was nothing to commit. The snapshot is queued
    /// for the history index before the lock is released.
    pub async fn commit_locked(
        &self,
        _guard: &TreeGuard,
        changes: Vec<PathChange>,
        kind: SnapshotKind,
        subject: &str,
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> VcsResult<Option<Snapshot>> {
        let message = kind.commit_message(subject);
        let result = vcs::blocking(&self.vcs, move |vcs| vcs.commit(&changes, &message)).await;

        let info = match result {
            Ok(info) => info,
            Err(VcsError::NothingToCommit) => return Ok(None),
            Err(err) => return Err(err),
        };

        let snapshot = Snapshot {
            commit: info.commit,
            parent: info.parent,
            timestamp: info.timestamp,
            kind,
            message: subject.to_string(),
            changes: info.changes,
            window,
        };
        info!(commit = %snapshot.commit.short(), kind = kind.as_str(), "{}", subject);

        if self.snapshots.send(snapshot.clone()).is_err() {
            warn!("History index queue closed; snapshot {} not indexed", snapshot.commit.short());
        }
        Ok(Some(snapshot))
    }

    /// [`Self::commit_locked`] with the committer's retry policy.
    pub async fn commit_locked_with_retry(
        &self,
        guard: &TreeGuard,
        changes: Vec<PathChange>,
        kind: SnapshotKind,
        subject: &str,
    ) -> VcsResult<Option<Snapshot>> {
        let limit = self.policy.retry_limit.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .commit_locked(guard, changes.clone(), kind, subject, None)
                .await
            {
                Err(err) if attempt < limit => {
                    warn!(attempt, "{} commit failed, retrying: {}", kind.as_str(), err);
                    tokio::time::sleep(self.policy.backoff(attempt)).await;
                }
                result => return result,
            }
        }
    }

    /// Flag paths whose on-disk state could not be committed outside the
    /// normal pipeline, so the next change set picks them up.
    pub fn flag_uncommitted(&self, changes: Vec<PathChange>, error: &str) -> Vec<PathBuf> {
        let paths = lock(&self.pending).record_failure(ChangeSet::from_changes(changes), 1, error);
        self.bus.condition(Condition::SnapshotFailed {
            paths: paths.clone(),
            attempts: 1,
            error: error.to_string(),
        });
        paths
    }
}
