//! Line diffs between two versions of a file, for previews.

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use similar::{Algorithm, ChangeTag, TextDiff};

const CONTEXT_LINES: usize = 3;
const BINARY_SNIFF_LEN: usize = 8000;

/// Available diff algorithms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffAlgorithmType {
    #[default]
    Myers,
    Patience,
    Lcs,
}

impl DiffAlgorithmType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Myers => "Myers",
            Self::Patience => "Patience",
            Self::Lcs => "LCS",
        }
    }

    fn algorithm(&self) -> Algorithm {
        match self {
            Self::Myers => Algorithm::Myers,
            Self::Patience => Algorithm::Patience,
            Self::Lcs => Algorithm::Lcs,
        }
    }
}

impl fmt::Display for DiffAlgorithmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Statistics about the diff
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub lines_added: usize,
    pub lines_removed: usize,
    pub hunks: usize,
}

impl DiffStats {
    pub fn total_changes(&self) -> usize {
        self.lines_added + self.lines_removed
    }

    pub fn net_change(&self) -> isize {
        self.lines_added as isize - self.lines_removed as isize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDiff {
    /// Unified diff text; empty when both sides are identical.
    pub unified: String,
    pub stats: DiffStats,
    /// Either side is not text, so no line diff was produced.
    pub binary: bool,
}

impl VersionDiff {
    pub fn is_empty(&self) -> bool {
        self.unified.is_empty()
    }
}

/// Diff two versions of a file. `None` stands for "file absent".
pub fn diff_versions(
    old: Option<&[u8]>,
    new: Option<&[u8]>,
    old_label: &str,
    new_label: &str,
    algorithm: DiffAlgorithmType,
) -> VersionDiff {
    let old_label = if old.is_some() { old_label } else { "/dev/null" };
    let new_label = if new.is_some() { new_label } else { "/dev/null" };

    let (old_text, new_text) = match (as_text(old), as_text(new)) {
        (Some(old_text), Some(new_text)) => (old_text, new_text),
        _ => {
            let unified = if old == new {
                String::new()
            } else {
                format!("Binary files {} and {} differ\n", old_label, new_label)
            };
            return VersionDiff {
                unified,
                stats: DiffStats::default(),
                binary: true,
            };
        }
    };

    let diff = TextDiff::configure()
        .algorithm(algorithm.algorithm())
        .diff_lines(old_text, new_text);

    let mut stats = DiffStats {
        hunks: diff.grouped_ops(CONTEXT_LINES).len(),
        ..DiffStats::default()
    };
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => stats.lines_added += 1,
            ChangeTag::Delete => stats.lines_removed += 1,
            ChangeTag::Equal => {}
        }
    }

    let unified = if stats.hunks == 0 {
        String::new()
    } else {
        diff.unified_diff()
            .context_radius(CONTEXT_LINES)
            .header(old_label, new_label)
            .to_string()
    };

    VersionDiff {
        unified,
        stats,
        binary: false,
    }
}

/// Missing content diffs as empty text.
fn as_text(content: Option<&[u8]>) -> Option<&str> {
    let bytes = content.unwrap_or_default();
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
    if sniff.contains(&0) {
        return None;
    }
    std::str::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modified_text() {
        let diff = diff_versions(
            Some(b"line1\nline2\nline3\n".as_slice()),
            Some(b"line1\nmodified\nline3\n".as_slice()),
            "a/notes.txt",
            "b/notes.txt",
            DiffAlgorithmType::Myers,
        );

        assert!(!diff.binary);
        assert!(diff.unified.contains("--- a/notes.txt"));
        assert!(diff.unified.contains("+modified"));
        assert!(diff.unified.contains("-line2"));
        assert_eq!(diff.stats.lines_added, 1);
        assert_eq!(diff.stats.lines_removed, 1);
        assert_eq!(diff.stats.hunks, 1);
    }

    #[test]
    fn test_identical_versions_are_empty() {
        let diff = diff_versions(Some(b"same\n".as_slice()), Some(b"same\n".as_slice()), "a", "b", DiffAlgorithmType::Patience);
        assert!(diff.is_empty());
        assert_eq!(diff.stats.total_changes(), 0);
    }

    #[test]
    fn test_absent_side_uses_dev_null() {
        let diff = diff_versions(None, Some(b"hello\n".as_slice()), "a/new.txt", "b/new.txt", DiffAlgorithmType::Lcs);

        assert!(diff.unified.contains("--- /dev/null"));
        assert_eq!(diff.stats.lines_added, 1);
        assert_eq!(diff.stats.net_change(), 1);
    }

    #[test]
    fn test_binary_content() {
        let diff = diff_versions(
            Some(&[0u8, 1, 2][..]),
            Some(&[0u8, 1, 3][..]),
            "a/img.png",
            "b/img.png",
            DiffAlgorithmType::Myers,
        );

        assert!(diff.binary);
        assert_eq!(diff.unified, "Binary files a/img.png and b/img.png differ\n");
    }
}
