//! Last known state of the watched tree.
//!
//! The event source keeps a fingerprint for every watched file. Notifications
//! are checked against it, and a full reconciliation scan diffs a fresh walk
//! against it to recover events the platform dropped.

use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Result;

use super::events::{RawEvent, RawEventKind};
use super::filter::FileFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl Fingerprint {
    pub fn of(meta: &Metadata) -> Self {
        Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TreeState {
    entries: HashMap<PathBuf, Fingerprint>,
}

impl TreeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk the whole tree. Fails when the root is missing or unreadable.
    pub fn scan(filter: &FileFilter) -> Result<Self> {
        let mut entries = HashMap::new();
        for rel in filter.watchable_files()? {
            if let Ok(meta) = fs::symlink_metadata(filter.root().join(&rel)) {
                entries.insert(rel, Fingerprint::of(&meta));
            }
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, rel: &Path) -> bool {
        self.entries.contains_key(rel)
    }

    pub fn get(&self, rel: &Path) -> Option<Fingerprint> {
        self.entries.get(rel).copied()
    }

    pub fn set(&mut self, rel: PathBuf, fingerprint: Option<Fingerprint>) {
        match fingerprint {
            Some(fp) => {
                self.entries.insert(rel, fp);
            }
            None => {
                self.entries.remove(&rel);
            }
        }
    }

    /// Events that turn `self` into `newer`, ordered by path.
    pub fn diff(&self, newer: &TreeState) -> Vec<RawEvent> {
        let mut events = Vec::new();
        for (path, fp) in &newer.entries {
            match self.entries.get(path) {
                None => events.push(RawEvent::new(path.clone(), RawEventKind::Created)),
                Some(old) if old != fp => {
                    events.push(RawEvent::new(path.clone(), RawEventKind::Modified))
                }
                Some(_) => {}
            }
        }
        for path in self.entries.keys() {
            if !newer.entries.contains_key(path) {
                events.push(RawEvent::new(path.clone(), RawEventKind::Deleted));
            }
        }
        events.sort_by(|a, b| a.path.cmp(&b.path));
        events
    }

    /// Re-check one path after a notification and return the resulting events.
    ///
    /// Directories expand to their files: a new directory yields `Created` for
    /// everything inside it, a vanished one yields `Deleted` for every known file
    /// below it.
    pub fn observe(&mut self, filter: &FileFilter, rel: &Path) -> Vec<RawEvent> {
        let abs = filter.root().join(rel);
        match fs::symlink_metadata(&abs) {
            Ok(meta) if meta.is_dir() => {
                let mut events = Vec::new();
                let present = filter.files_under(rel).unwrap_or_default();
                for file in &present {
                    events.extend(self.observe_file(filter, file));
                }
                let vanished: Vec<PathBuf> = self
                    .entries
                    .keys()
                    .filter(|p| p.starts_with(rel) && !present.contains(p))
                    .cloned()
                    .collect();
                for path in vanished {
                    self.entries.remove(&path);
                    events.push(RawEvent::new(path, RawEventKind::Deleted));
                }
                events
            }
            Ok(meta) => {
                if filter.is_ignored_relative(rel, false) {
                    return Vec::new();
                }
                self.record_file(rel, Fingerprint::of(&meta))
                    .into_iter()
                    .collect()
            }
            Err(_) => self.forget(rel),
        }
    }

    /// Apply a rename reported as a single notification.
    pub fn rename(&mut self, filter: &FileFilter, from: &Path, to: &Path) -> Vec<RawEvent> {
        let abs_to = filter.root().join(to);
        let to_meta = match fs::symlink_metadata(&abs_to) {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                let mut events = self.observe(filter, from);
                events.extend(self.observe(filter, to));
                return events;
            }
        };
        if !self.entries.contains_key(from) || filter.is_ignored_relative(to, false) {
            let mut events = self.observe(filter, from);
            events.extend(self.observe(filter, to));
            return events;
        }

        self.entries.remove(from);
        let replaced = self
            .entries
            .insert(to.to_path_buf(), Fingerprint::of(&to_meta))
            .is_some();

        if replaced {
            // Save-by-rename over an existing file: the target was modified in place.
            vec![
                RawEvent::new(from.to_path_buf(), RawEventKind::Deleted),
                RawEvent::new(to.to_path_buf(), RawEventKind::Modified),
            ]
        } else {
            vec![RawEvent::new(
                to.to_path_buf(),
                RawEventKind::Renamed {
                    from: from.to_path_buf(),
                },
            )]
        }
    }

    /// Bring the given paths up to date without emitting anything.
    pub fn refresh(&mut self, filter: &FileFilter, paths: &[PathBuf]) {
        for rel in paths {
            let fingerprint = fs::symlink_metadata(filter.root().join(rel))
                .ok()
                .filter(|meta| meta.is_file())
                .map(|meta| Fingerprint::of(&meta));
            self.set(rel.clone(), fingerprint);
        }
    }

    fn observe_file(&mut self, filter: &FileFilter, rel: &Path) -> Option<RawEvent> {
        let meta = fs::symlink_metadata(filter.root().join(rel)).ok()?;
        self.record_file(rel, Fingerprint::of(&meta))
    }

    fn record_file(&mut self, rel: &Path, fingerprint: Fingerprint) -> Option<RawEvent> {
        match self.entries.insert(rel.to_path_buf(), fingerprint) {
            None => Some(RawEvent::new(rel.to_path_buf(), RawEventKind::Created)),
            Some(old) if old != fingerprint => {
                Some(RawEvent::new(rel.to_path_buf(), RawEventKind::Modified))
            }
            Some(_) => None,
        }
    }

    fn forget(&mut self, rel: &Path) -> Vec<RawEvent> {
        let mut gone: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|p| p.starts_with(rel))
            .cloned()
            .collect();
        gone.sort();
        for path in &gone {
            self.entries.remove(path);
        }
        gone.into_iter()
            .map(|path| RawEvent::new(path, RawEventKind::Deleted))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn kinds(events: &[RawEvent]) -> Vec<(PathBuf, RawEventKind)> {
        events
            .iter()
            .map(|e| (e.path.clone(), e.kind.clone()))
            .collect()
    }

    #[test]
    fn test_diff_detects_missed_changes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.txt"), "same").unwrap();
        fs::write(dir.path().join("edit.txt"), "short").unwrap();
        fs::write(dir.path().join("gone.txt"), "bye").unwrap();
        let filter = FileFilter::new(dir.path()).unwrap();
        let before = TreeState::scan(&filter).unwrap();

        fs::write(dir.path().join("edit.txt"), "much longer content").unwrap();
        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        fs::write(dir.path().join("new.txt"), "hi").unwrap();
        let after = TreeState::scan(&filter).unwrap();

        assert_eq!(
            kinds(&before.diff(&after)),
            vec![
                (PathBuf::from("edit.txt"), RawEventKind::Modified),
                (PathBuf::from("gone.txt"), RawEventKind::Deleted),
                (PathBuf::from("new.txt"), RawEventKind::Created),
            ]
        );
    }

    #[test]
    fn test_observe_file_lifecycle() {
        let dir = TempDir::new().unwrap();
        let filter = FileFilter::new(dir.path()).unwrap();
        let mut state = TreeState::new();
        let rel = Path::new("a.txt");

        fs::write(dir.path().join(rel), "one").unwrap();
        assert_eq!(kinds(&state.observe(&filter, rel)), vec![(rel.to_path_buf(), RawEventKind::Created)]);

        // Unchanged fingerprint produces nothing
        assert!(state.observe(&filter, rel).is_empty());

        fs::write(dir.path().join(rel), "one two three").unwrap();
        assert_eq!(kinds(&state.observe(&filter, rel)), vec![(rel.to_path_buf(), RawEventKind::Modified)]);

        fs::remove_file(dir.path().join(rel)).unwrap();
        assert_eq!(kinds(&state.observe(&filter, rel)), vec![(rel.to_path_buf(), RawEventKind::Deleted)]);
        assert!(state.is_empty());
    }

    #[test]
    fn test_observe_removed_directory() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/a.txt"), "a").unwrap();
        fs::write(dir.path().join("docs/b.txt"), "b").unwrap();
        let filter = FileFilter::new(dir.path()).unwrap();
        let mut state = TreeState::scan(&filter).unwrap();

        fs::remove_dir_all(dir.path().join("docs")).unwrap();
        let events = state.observe(&filter, Path::new("docs"));

        assert_eq!(
            kinds(&events),
            vec![
                (PathBuf::from("docs/a.txt"), RawEventKind::Deleted),
                (PathBuf::from("docs/b.txt"), RawEventKind::Deleted),
            ]
        );
    }

    #[test]
    fn test_rename_over_existing_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("doc.txt"), "old").unwrap();
        fs::write(dir.path().join("doc.txt.swp"), "new contents").unwrap();
        let filter = FileFilter::new(dir.path()).unwrap();
        let mut state = TreeState::scan(&filter).unwrap();

        fs::rename(dir.path().join("doc.txt.swp"), dir.path().join("doc.txt")).unwrap();
        let events = state.rename(&filter, Path::new("doc.txt.swp"), Path::new("doc.txt"));

        assert_eq!(
            kinds(&events),
            vec![
                (PathBuf::from("doc.txt.swp"), RawEventKind::Deleted),
                (PathBuf::from("doc.txt"), RawEventKind::Modified),
            ]
        );
    }

    #[test]
    fn test_plain_rename() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "content").unwrap();
        let filter = FileFilter::new(dir.path()).unwrap();
        let mut state = TreeState::scan(&filter).unwrap();

        fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt")).unwrap();
        let events = state.rename(&filter, Path::new("a.txt"), Path::new("b.txt"));

        assert_eq!(
            kinds(&events),
            vec![(
                PathBuf::from("b.txt"),
                RawEventKind::Renamed {
                    from: PathBuf::from("a.txt")
                }
            )]
        );
        assert!(!state.contains(Path::new("a.txt")));
    }

    #[test]
    fn test_refresh_is_silent() {
        let dir = TempDir::new().unwrap();
        let filter = FileFilter::new(dir.path()).unwrap();
        let mut state = TreeState::new();

        fs::write(dir.path().join("r.txt"), "restored").unwrap();
        state.refresh(&filter, &[PathBuf::from("r.txt")]);

        assert!(state.contains(Path::new("r.txt")));
        assert!(state.observe(&filter, Path::new("r.txt")).is_empty());
    }
}
