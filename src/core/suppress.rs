//! Ignore-path-until set consulted by the event source.
//!
//! The restore engine holds the paths it is about to write, then releases them
//! with a short grace period so late notifications for its own writes are dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    /// Writes in progress; suppressed until released.
    Writing,
    /// Released; still suppressed until the deadline.
    Until(Instant),
}

#[derive(Debug, Default)]
pub struct SuppressionSet {
    entries: HashMap<PathBuf, Hold>,
}

impl SuppressionSet {
    pub fn hold(&mut self, paths: &[PathBuf]) {
        for path in paths {
            self.entries.insert(path.clone(), Hold::Writing);
        }
    }

    pub fn release(&mut self, paths: &[PathBuf], grace: Duration, now: Instant) {
        for path in paths {
            self.entries.insert(path.clone(), Hold::Until(now + grace));
        }
    }

    pub fn is_suppressed(&mut self, path: &Path, now: Instant) -> bool {
        match self.entries.get(path) {
            Some(Hold::Writing) => true,
            Some(Hold::Until(deadline)) if *deadline > now => true,
            Some(Hold::Until(_)) => {
                self.entries.remove(path);
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared handle to a [`SuppressionSet`].
#[derive(Debug, Clone, Default)]
pub struct Suppressions {
    inner: Arc<Mutex<SuppressionSet>>,
}

impl Suppressions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self, paths: &[PathBuf]) {
        lock(&self.inner).hold(paths);
    }

    pub fn release(&self, paths: &[PathBuf], grace: Duration) {
        lock(&self.inner).release(paths, grace, Instant::now());
    }

    pub fn is_suppressed(&self, path: &Path) -> bool {
        lock(&self.inner).is_suppressed(path, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hold_and_release_with_grace() {
        let mut set = SuppressionSet::default();
        let path = PathBuf::from("a.txt");
        let start = Instant::now();

        set.hold(&[path.clone()]);
        assert!(set.is_suppressed(&path, start + Duration::from_secs(3600)));

        set.release(&[path.clone()], Duration::from_millis(500), start);
        assert!(set.is_suppressed(&path, start + Duration::from_millis(499)));
        assert!(!set.is_suppressed(&path, start + Duration::from_millis(500)));

        // Expired entries are dropped
        assert!(set.is_empty());
    }

    #[test]
    fn test_only_held_paths_are_suppressed() {
        let suppressions = Suppressions::new();
        suppressions.hold(&[PathBuf::from("restored.txt")]);

        assert!(suppressions.is_suppressed(Path::new("restored.txt")));
        assert!(!suppressions.is_suppressed(Path::new("other.txt")));
    }
}
