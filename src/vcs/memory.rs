//! In-memory backend for testing.
//!
//! Commits copy the on-disk content of the named paths into a tree held in
//! memory. Failures can be injected to exercise the committer's retry path.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{CommitInfo, LogEntry, Vcs, VcsError, VcsResult};
use crate::core::events::{changes_from_presence, ChangeKind, CommitRef, PathChange, SnapshotKind};
use crate::core::filter::FileFilter;
use crate::core::lock;

type Tree = BTreeMap<PathBuf, Vec<u8>>;

#[derive(Debug, Clone)]
struct MemoryCommit {
    entry: LogEntry,
    tree: Tree,
}

#[derive(Debug, Default)]
struct MemoryState {
    commits: Vec<MemoryCommit>,
    fail_next: u32,
    attempts: u32,
    lost: BTreeSet<(CommitRef, PathBuf)>,
}

#[derive(Debug)]
pub struct MemoryVcs {
    root: PathBuf,
    renames: bool,
    state: Mutex<MemoryState>,
}

impl MemoryVcs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            renames: true,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_renames(mut self, supported: bool) -> Self {
        self.renames = supported;
        self
    }

    /// Make the next `count` commit attempts fail.
    pub fn fail_next(&self, count: u32) {
        lock(&self.state).fail_next = count;
    }

    /// Make the stored content of `path` at `commit` unreadable, as a damaged
    /// object store would.
    pub fn lose_blob(&self, commit: &CommitRef, path: impl Into<PathBuf>) {
        let mut state = lock(&self.state);
        if let Some(found) = Self::find(&state, commit).map(|c| c.entry.commit.clone()) {
            state.lost.insert((found, path.into()));
        }
    }

    /// Commit attempts so far, failed ones included.
    pub fn commit_attempts(&self) -> u32 {
        lock(&self.state).attempts
    }

    pub fn commit_count(&self) -> usize {
        lock(&self.state).commits.len()
    }

    fn head_tree(state: &MemoryState) -> Tree {
        state
            .commits
            .last()
            .map(|c| c.tree.clone())
            .unwrap_or_default()
    }

    fn push_commit(
        state: &mut MemoryState,
        tree: Tree,
        message: &str,
        changes: Vec<PathChange>,
    ) -> CommitInfo {
        let sequence = state.commits.len() as u64 + 1;
        let commit = commit_id(sequence);
        let parent = state.commits.last().map(|c| c.entry.commit.clone());
        let previous = state.commits.last().map(|c| c.entry.timestamp);
        let now = Utc::now();
        let timestamp: DateTime<Utc> = previous.map_or(now, |p| p.max(now));

        state.commits.push(MemoryCommit {
            entry: LogEntry {
                commit: commit.clone(),
                parent: parent.clone(),
                timestamp,
                message: message.to_string(),
                changes: changes.clone(),
            },
            tree,
        });

        CommitInfo {
            commit,
            parent,
            timestamp,
            changes,
        }
    }

    fn find<'a>(state: &'a MemoryState, commit: &CommitRef) -> Option<&'a MemoryCommit> {
        let mut matches = state
            .commits
            .iter()
            .filter(|c| c.entry.commit.as_str().starts_with(commit.as_str()));
        let found = matches.next()?;
        matches.next().is_none().then_some(found)
    }
}

/// Deterministic 40-character ids with well-spread prefixes.
fn commit_id(sequence: u64) -> CommitRef {
    let mut z = sequence.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    let text = format!("{:016x}{:024x}", z, sequence);
    CommitRef::parse(&text).unwrap_or_else(|| unreachable!("hex id"))
}

impl Vcs for MemoryVcs {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_initialized(&self) -> VcsResult<CommitRef> {
        let mut state = lock(&self.state);
        if let Some(last) = state.commits.last() {
            return Ok(last.entry.commit.clone());
        }
        let message = SnapshotKind::Initial.commit_message("Start tracking");
        Ok(Self::push_commit(&mut state, Tree::new(), &message, Vec::new()).commit)
    }

    fn head(&self) -> VcsResult<Option<CommitRef>> {
        Ok(lock(&self.state)
            .commits
            .last()
            .map(|c| c.entry.commit.clone()))
    }

    fn commit(&self, changes: &[PathChange], message: &str) -> VcsResult<CommitInfo> {
        let mut state = lock(&self.state);
        state.attempts += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(VcsError::backend("injected commit failure"));
        }

        let before = Self::head_tree(&state);
        let mut after = before.clone();
        let mut presence = BTreeMap::new();
        let staged: BTreeSet<&Path> = changes.iter().flat_map(|c| c.staged_paths()).collect();

        for path in staged {
            let abs = self.root.join(path);
            match std::fs::read(&abs) {
                Ok(content) if abs.is_file() => {
                    after.insert(path.to_path_buf(), content);
                }
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    after.remove(path);
                }
                Err(err) => return Err(VcsError::Io(err)),
            }
            let old = before.get(path);
            let new = after.get(path);
            if old != new {
                presence.insert(path.to_path_buf(), (old.is_some(), new.is_some()));
            }
        }

        if presence.is_empty() {
            return Err(VcsError::NothingToCommit);
        }

        let renames = if self.renames {
            changes
                .iter()
                .filter_map(|c| match &c.kind {
                    ChangeKind::Renamed { from } => Some((from.clone(), c.path.clone())),
                    _ => None,
                })
                .collect()
        } else {
            Vec::new()
        };
        let recorded = changes_from_presence(presence, renames);
        Ok(Self::push_commit(&mut state, after, message, recorded))
    }

    fn resolve(&self, commit: &CommitRef) -> VcsResult<Option<CommitRef>> {
        let state = lock(&self.state);
        Ok(Self::find(&state, commit).map(|c| c.entry.commit.clone()))
    }

    fn read(&self, commit: &CommitRef, path: &Path) -> VcsResult<Option<Vec<u8>>> {
        let state = lock(&self.state);
        let found = Self::find(&state, commit)
            .ok_or_else(|| VcsError::UnknownRevision(commit.to_string()))?;
        if state.lost.contains(&(found.entry.commit.clone(), path.to_path_buf())) {
            return Err(VcsError::UnknownRevision(format!("{}:{}", commit, path.display())));
        }
        Ok(found.tree.get(path).cloned())
    }

    fn list_files(&self, commit: &CommitRef) -> VcsResult<Vec<PathBuf>> {
        let state = lock(&self.state);
        let found = Self::find(&state, commit)
            .ok_or_else(|| VcsError::UnknownRevision(commit.to_string()))?;
        Ok(found.tree.keys().cloned().collect())
    }

    fn log(&self) -> VcsResult<Vec<LogEntry>> {
        Ok(lock(&self.state)
            .commits
            .iter()
            .map(|c| c.entry.clone())
            .collect())
    }

    fn dirty_paths(&self) -> VcsResult<Vec<PathBuf>> {
        let head = Self::head_tree(&lock(&self.state));
        let filter = FileFilter::new(&self.root).map_err(|e| VcsError::backend(format!("{:#}", e)))?;
        let on_disk = filter
            .watchable_files()
            .map_err(|e| VcsError::backend(format!("{:#}", e)))?;

        let mut dirty: BTreeSet<PathBuf> = head
            .keys()
            .filter(|p| !on_disk.contains(*p))
            .cloned()
            .collect();
        for path in on_disk {
            let content = std::fs::read(self.root.join(&path))?;
            if head.get(&path) != Some(&content) {
                dirty.insert(path);
            }
        }
        Ok(dirty.into_iter().collect())
    }

    fn supports_renames(&self) -> bool {
        self.renames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_commit_read_and_resolve() {
        let dir = TempDir::new().unwrap();
        let vcs = MemoryVcs::new(dir.path());
        let initial = vcs.ensure_initialized().unwrap();

        fs::write(dir.path().join("a.txt"), "one").unwrap();
        let info = vcs
            .commit(&[PathChange::new("a.txt", ChangeKind::Added)], "Add a.txt")
            .unwrap();

        assert_eq!(info.parent, Some(initial.clone()));
        assert_eq!(vcs.read(&info.commit, Path::new("a.txt")).unwrap(), Some(b"one".to_vec()));
        assert_eq!(vcs.read(&initial, Path::new("a.txt")).unwrap(), None);

        let short = CommitRef::parse(info.commit.short()).unwrap();
        assert_eq!(vcs.resolve(&short).unwrap(), Some(info.commit));
    }

    #[test]
    fn test_injected_failures_and_nothing_to_commit() {
        let dir = TempDir::new().unwrap();
        let vcs = MemoryVcs::new(dir.path());
        vcs.ensure_initialized().unwrap();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        let change = [PathChange::new("a.txt", ChangeKind::Added)];

        vcs.fail_next(2);
        assert!(matches!(vcs.commit(&change, "Add a.txt"), Err(VcsError::Backend(_))));
        assert!(matches!(vcs.commit(&change, "Add a.txt"), Err(VcsError::Backend(_))));
        assert!(vcs.commit(&change, "Add a.txt").is_ok());
        assert!(matches!(vcs.commit(&change, "Add a.txt"), Err(VcsError::NothingToCommit)));
        assert_eq!(vcs.commit_attempts(), 4);
        assert_eq!(vcs.commit_count(), 2);
    }

    #[test]
    fn test_dirty_paths_against_head() {
        let dir = TempDir::new().unwrap();
        let vcs = MemoryVcs::new(dir.path());
        vcs.ensure_initialized().unwrap();
        fs::write(dir.path().join("kept.txt"), "k").unwrap();
        fs::write(dir.path().join("gone.txt"), "g").unwrap();
        vcs.commit(
            &[
                PathChange::new("kept.txt", ChangeKind::Added),
                PathChange::new("gone.txt", ChangeKind::Added),
            ],
            "Add 2 files",
        )
        .unwrap();

        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        fs::write(dir.path().join("new.txt"), "n").unwrap();

        assert_eq!(
            vcs.dirty_paths().unwrap(),
            vec![PathBuf::from("gone.txt"), PathBuf::from("new.txt")]
        );
    }
}
