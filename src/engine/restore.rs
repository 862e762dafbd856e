//! Restore Engine: writes earlier versions back into the working directory.
//!
//! A restore holds the tree lock from start to finish. It records the current
//! state of the target paths as a pre-restore snapshot, writes the target
//! versions with the file event source told to look away, and finally commits
//! the result as a restore snapshot. Nothing is written unless every target
//! version could be read first.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::committer::SnapshotCommitter;
use crate::core::events::{ChangeKind, CommitRef, Condition, EventBus, PathChange, SnapshotKind};
use crate::core::watcher::WatchControl;
use crate::error::RestoreError;
use crate::vcs::{self, VcsError};

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

const TEMP_SUFFIX: &str = ".file-control-restore";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreTarget {
    /// Files (or directories) relative to the watched root.
    Paths(Vec<PathBuf>),
    /// The whole tree.
    Tree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub target: RestoreTarget,
    pub commit: CommitRef,
}

impl RestoreRequest {
    pub fn paths(paths: Vec<PathBuf>, commit: CommitRef) -> Self {
        Self {
            target: RestoreTarget::Paths(paths),
            commit,
        }
    }

    pub fn tree(commit: CommitRef) -> Self {
        Self {
            target: RestoreTarget::Tree,
            commit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    /// The snapshot that was restored, fully resolved.
    pub target: CommitRef,
    /// Snapshot holding the state from just before the restore. Restoring it
    /// undoes this restore.
    pub pre_restore: CommitRef,
    /// Commit recording the restored state; `None` when the tree already
    /// matched or the commit failed (the paths are then pending).
    pub restore_snapshot: Option<CommitRef>,
    pub written: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// Handle on a submitted restore.
#[derive(Debug)]
pub struct RestoreTicket {
    state: Arc<AtomicU8>,
    result: oneshot::Receiver<Result<RestoreOutcome, RestoreError>>,
}

impl RestoreTicket {
    /// Cancel the restore. Only succeeds before the pre-restore snapshot is
    /// taken; after that the restore runs to completion.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STARTED
    }

    pub async fn outcome(self) -> Result<RestoreOutcome, RestoreError> {
        self.result.await.unwrap_or(Err(RestoreError::Stopped))
    }
}

pub struct RestoreEngine {
    committer: Arc<SnapshotCommitter>,
    control: WatchControl,
    bus: EventBus,
}

impl RestoreEngine {
    pub fn new(committer: Arc<SnapshotCommitter>, control: WatchControl, bus: EventBus) -> Self {
        Self {
            committer,
            control,
            bus,
        }
    }

    /// Queue a restore. It starts once the tree lock is free.
    pub fn submit(self: &Arc<Self>, request: RestoreRequest) -> RestoreTicket {
        let state = Arc::new(AtomicU8::new(PENDING));
        let (reply, result) = oneshot::channel();
        let engine = self.clone();
        let task_state = state.clone();
        tokio::spawn(async move {
            let outcome = engine.restore(&request, &task_state).await;
            if let Err(err) = &outcome {
                warn!(commit = %request.commit.short(), "Restore did not complete: {}", err);
            }
            let _ = reply.send(outcome);
        });
        RestoreTicket { state, result }
    }

    async fn restore(
        &self,
        request: &RestoreRequest,
        state: &AtomicU8,
    ) -> Result<RestoreOutcome, RestoreError> {
        let guard = self.committer.lock_tree().await;
        if state.load(Ordering::SeqCst) == CANCELLED {
            return Err(RestoreError::Cancelled);
        }
        let vcs = self.committer.vcs().clone();

        let requested = request.commit.clone();
        let commit = match vcs::blocking(&vcs, move |vcs| vcs.resolve(&requested)).await? {
            Some(commit) => commit,
            None => return Err(self.unresolvable(request)),
        };

        let paths = match self.target_paths(&request.target, &commit).await {
            Ok(paths) => paths,
            Err(RestoreError::Vcs(VcsError::UnknownRevision(_))) => {
                return Err(self.unresolvable(request))
            }
            Err(err) => return Err(err),
        };
        if paths.is_empty() {
            debug!("Nothing to restore");
        }

        let read_commit = commit.clone();
        let read_paths = paths.clone();
        let contents = match vcs::blocking(&vcs, move |vcs| {
            read_paths
                .into_iter()
                .map(|path| {
                    let content = vcs.read(&read_commit, &path)?;
                    Ok((path, content))
                })
                .collect::<Result<Vec<_>, VcsError>>()
        })
        .await
        {
            Ok(contents) => contents,
            Err(VcsError::UnknownRevision(_)) => return Err(self.unresolvable(request)),
            Err(err) => return Err(err.into()),
        };

        if state
            .compare_exchange(PENDING, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RestoreError::Cancelled);
        }

        let label = describe(&request.target, &paths);
        let touched: Vec<PathChange> = paths
            .iter()
            .map(|p| PathChange::new(p.clone(), ChangeKind::Modified))
            .collect();

        let pre_restore = match self
            .committer
            .commit_locked_with_retry(
                &guard,
                touched,
                SnapshotKind::PreRestore,
                &format!("Before restoring {} to {}", label, commit.short()),
            )
            .await
        {
            Ok(Some(snapshot)) => snapshot.commit,
            Ok(None) => match vcs::blocking(&vcs, |vcs| vcs.head()).await {
                Ok(Some(head)) => head,
                Ok(None) => return Err(RestoreError::PreRestoreFailed(VcsError::backend("no HEAD"))),
                Err(err) => return Err(RestoreError::PreRestoreFailed(err)),
            },
            Err(err) => return Err(RestoreError::PreRestoreFailed(err)),
        };

        let mut suppressed = paths.clone();
        suppressed.extend(paths.iter().map(|p| temp_path(p)));
        self.control.suppress(&suppressed);

        let root = self.control.filter().root().to_path_buf();
        let report = tokio::task::spawn_blocking(move || materialize(&root, contents))
            .await
            .unwrap_or_else(|err| Materialized {
                failure: Some(RestoreError::Io {
                    path: PathBuf::new(),
                    source: io::Error::new(io::ErrorKind::Other, err.to_string()),
                }),
                ..Materialized::default()
            });

        self.control.resume(&suppressed);

        let written_changes: Vec<PathChange> = report
            .written
            .iter()
            .chain(report.removed.iter())
            .map(|p| PathChange::new(p.clone(), ChangeKind::Modified))
            .collect();

        if let Some(failure) = report.failure {
            error!("Restore stopped part way: {}", failure);
            if !written_changes.is_empty() {
                self.committer.flag_uncommitted(written_changes, &failure.to_string());
            }
            return Err(failure);
        }

        let restore_snapshot = if written_changes.is_empty() {
            None
        } else {
            match self
                .committer
                .commit_locked_with_retry(
                    &guard,
                    written_changes.clone(),
                    SnapshotKind::Restore,
                    &format!("Restore {} to {}", label, commit.short()),
                )
                .await
            {
                Ok(snapshot) => snapshot.map(|s| s.commit),
                Err(err) => {
                    warn!("Restored files could not be committed: {}", err);
                    self.committer.flag_uncommitted(written_changes, &err.to_string());
                    None
                }
            }
        };

        info!(
            target = %commit.short(),
            written = report.written.len(),
            removed = report.removed.len(),
            "Restored {}",
            label
        );
        Ok(RestoreOutcome {
            target: commit,
            pre_restore,
            restore_snapshot,
            written: report.written,
            removed: report.removed,
        })
    }

    fn unresolvable(&self, request: &RestoreRequest) -> RestoreError {
        let paths = match &request.target {
            RestoreTarget::Paths(paths) => paths.clone(),
            RestoreTarget::Tree => Vec::new(),
        };
        self.bus.condition(Condition::SnapshotUnresolvable {
            commit: request.commit.to_string(),
            paths,
        });
        RestoreError::Unresolvable {
            commit: request.commit.to_string(),
        }
    }

    /// Expand the request into the files it covers, relative to the root.
    async fn target_paths(
        &self,
        target: &RestoreTarget,
        commit: &CommitRef,
    ) -> Result<Vec<PathBuf>, RestoreError> {
        let vcs = self.committer.vcs().clone();
        let filter = self.control.filter().clone();
        let listed = commit.clone();
        let at_target: BTreeSet<PathBuf> =
            vcs::blocking(&vcs, move |vcs| vcs.list_files(&listed)).await?.into_iter().collect();

        let mut paths = BTreeSet::new();
        match target {
            RestoreTarget::Tree => {
                let at_head = vcs::blocking(&vcs, |vcs| match vcs.head()? {
                    Some(head) => vcs.list_files(&head),
                    None => Ok(Vec::new()),
                })
                .await?;
                let on_disk = filter
                    .watchable_files()
                    .map_err(|e| VcsError::backend(format!("{:#}", e)))?;
                paths.extend(at_target.iter().cloned());
                paths.extend(at_head);
                paths.extend(on_disk);
            }
            RestoreTarget::Paths(requested) => {
                for path in requested {
                    let rel = filter
                        .relative(path)
                        .ok_or_else(|| RestoreError::OutsideTree(path.clone()))?;
                    if filter.is_ignored_relative(&rel, false) {
                        return Err(RestoreError::OutsideTree(path.clone()));
                    }
                    let is_dir = filter.root().join(&rel).is_dir();
                    if at_target.contains(&rel) || (!is_dir && !has_children(&at_target, &rel)) {
                        paths.insert(rel);
                        continue;
                    }
                    paths.extend(at_target.iter().filter(|p| p.starts_with(&rel)).cloned());
                    if is_dir {
                        paths.extend(
                            filter
                                .files_under(&rel)
                                .map_err(|e| VcsError::backend(format!("{:#}", e)))?,
                        );
                    }
                }
            }
        }
        paths.retain(|p| !filter.is_ignored_relative(p, false));
        Ok(paths.into_iter().collect())
    }
}

fn has_children(files: &BTreeSet<PathBuf>, dir: &Path) -> bool {
    files.iter().any(|p| p != dir && p.starts_with(dir))
}

fn describe(target: &RestoreTarget, paths: &[PathBuf]) -> String {
    match (target, paths) {
        (RestoreTarget::Tree, _) => "all files".to_string(),
        (RestoreTarget::Paths(_), [single]) => single.display().to_string(),
        (RestoreTarget::Paths(_), many) => format!("{} files", many.len()),
    }
}

fn temp_path(rel: &Path) -> PathBuf {
    let mut name = rel.file_name().unwrap_or_default().to_os_string();
    name.push(TEMP_SUFFIX);
    rel.with_file_name(format!(".{}", name.to_string_lossy()))
}

#[derive(Default)]
struct Materialized {
    written: Vec<PathBuf>,
    removed: Vec<PathBuf>,
    failure: Option<RestoreError>,
}

/// Write every version to disk. Files are replaced through a temporary file
/// so a reader never sees a half-written version.
fn materialize(root: &Path, contents: Vec<(PathBuf, Option<Vec<u8>>)>) -> Materialized {
    let mut report = Materialized::default();
    for (rel, content) in contents {
        let result = match &content {
            Some(bytes) => write_atomic(root, &rel, bytes),
            None => remove_if_present(&root.join(&rel)),
        };
        match result {
            Ok(false) => {}
            Ok(true) if content.is_some() => report.written.push(rel),
            Ok(true) => report.removed.push(rel),
            Err(source) => {
                report.failure = Some(RestoreError::Io { path: rel, source });
                break;
            }
        }
    }
    report
}

/// Returns `false` when the file already held `bytes`.
fn write_atomic(root: &Path, rel: &Path, bytes: &[u8]) -> io::Result<bool> {
    let abs = root.join(rel);
    if fs::read(&abs).map(|current| current == bytes).unwrap_or(false) {
        return Ok(false);
    }
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = root.join(temp_path(rel));
    fs::write(&tmp, bytes)?;
    if let Err(err) = fs::rename(&tmp, &abs) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(true)
}

fn remove_if_present(abs: &Path) -> io::Result<bool> {
    match fs::remove_file(abs) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
