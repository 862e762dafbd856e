use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;

/// Directory names that are never watched: version-control metadata.
pub const ALWAYS_IGNORED: &[&str] = &[".git"];

/// The watched tree: a root plus the set of ignored sub-paths.
///
/// Every path handed out by the filter is relative to the root.
#[derive(Debug, Clone)]
pub struct FileFilter {
    root_path: PathBuf,
    patterns: Gitignore,
    respect_gitignore: bool,
}

impl FileFilter {
    pub fn new<P: AsRef<Path>>(root_path: P) -> Result<Self> {
        Self::with_patterns(root_path, &[], true)
    }

    /// Build a filter with extra gitignore-style patterns on top of the built-in ignore set.
    pub fn with_patterns<P: AsRef<Path>>(
        root_path: P,
        patterns: &[String],
        respect_gitignore: bool,
    ) -> Result<Self> {
        let root_path = root_path.as_ref().to_path_buf();
        let mut builder = GitignoreBuilder::new(&root_path);

        if respect_gitignore {
            let gitignore = root_path.join(".gitignore");
            if gitignore.is_file() {
                if let Some(err) = builder.add(&gitignore) {
                    tracing::warn!("Ignoring unreadable .gitignore entries: {}", err);
                }
            }
        }

        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .with_context(|| format!("Invalid ignore pattern: {}", pattern))?;
        }

        let patterns = builder.build().context("Failed to build ignore matcher")?;

        Ok(Self {
            root_path,
            patterns,
            respect_gitignore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root_path
    }

    /// Convert a path (absolute or already relative) into a root-relative path.
    ///
    /// Returns `None` for the root itself and for anything outside it.
    pub fn relative(&self, path: &Path) -> Option<PathBuf> {
        let rel = if path.is_absolute() {
            path.strip_prefix(&self.root_path).ok()?.to_path_buf()
        } else {
            path.to_path_buf()
        };

        let clean: PathBuf = rel
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();

        if clean.as_os_str().is_empty()
            || clean
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(clean)
    }

    pub fn is_ignored_relative(&self, rel: &Path, is_dir: bool) -> bool {
        let in_metadata = rel.components().any(|comp| match comp {
            Component::Normal(name) => ALWAYS_IGNORED.iter().any(|ignored| name == *ignored),
            _ => false,
        });
        if in_metadata {
            return true;
        }
        self.patterns
            .matched_path_or_any_parents(rel, is_dir)
            .is_ignore()
    }

    pub fn should_watch<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        match self.relative(path) {
            Some(rel) => {
                let is_dir = self.root_path.join(&rel).is_dir();
                !self.is_ignored_relative(&rel, is_dir)
            }
            None => false,
        }
    }

    /// Every watchable file in the tree, relative to the root.
    pub fn watchable_files(&self) -> Result<Vec<PathBuf>> {
        self.files_under(Path::new(""))
    }

    /// Every watchable file below `rel` (a root-relative directory).
    pub fn files_under(&self, rel: &Path) -> Result<Vec<PathBuf>> {
        let start = self.root_path.join(rel);
        if !start.is_dir() {
            anyhow::bail!("Directory does not exist: {}", start.display());
        }
        let mut files = Vec::new();

        let walker = WalkBuilder::new(&start)
            .hidden(false)
            .git_ignore(self.respect_gitignore)
            .git_exclude(self.respect_gitignore)
            .git_global(false)
            .ignore(false)
            .parents(self.respect_gitignore)
            .require_git(false)
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map_or(true, |name| !ALWAYS_IGNORED.contains(&name))
            })
            .build();

        for result in walker {
            match result {
                Ok(entry) => {
                    if !entry.file_type().map_or(false, |ft| ft.is_file()) {
                        continue;
                    }
                    if let Some(rel) = self.relative(entry.path()) {
                        if !self.is_ignored_relative(&rel, false) {
                            files.push(rel);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("Error walking directory: {}", err);
                }
            }
        }

        files.sort();
        Ok(files)
    }
}
