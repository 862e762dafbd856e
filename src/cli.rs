use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use crate::config::EngineConfig;
use crate::diff::DiffAlgorithmType;

#[derive(Parser)]
#[command(name = "file-control")]
#[command(version)]
#[command(about = "Automatic version history for a directory")]
#[command(long_about = "file-control watches a directory and records every settled change as a snapshot in git. Earlier versions of any file can be listed, previewed and restored, and every restore can itself be undone.")]
pub struct Cli {
    /// Directory to keep history for
    #[arg(value_name = "PATH", help = "Directory to watch (defaults to current directory)")]
    pub path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Output format
    #[arg(long, global = true, default_value = "text", help = "Output format")]
    pub output: OutputFormat,

    /// Configuration file
    #[arg(long, global = true, value_name = "FILE", help = "TOML configuration file")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Disable colors in output
    #[arg(long, global = true, help = "Disable colored output")]
    pub no_color: bool,

    /// Quiet interval before a change set closes
    #[arg(long, global = true, help = "Quiet interval in ms before snapshotting")]
    pub quiet_ms: Option<u64>,

    /// Longest a change set may stay open
    #[arg(long, global = true, help = "Maximum change window in seconds")]
    pub max_window_secs: Option<u64>,

    /// Ignore additional patterns beyond .gitignore
    #[arg(long, global = true, value_delimiter = ',', help = "Additional patterns to ignore")]
    pub ignore: Option<Vec<String>>,

    /// Start with automatic snapshots paused
    #[arg(long, global = true, help = "Start paused (type 'resume' while watching to continue)")]
    pub paused: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Watch the directory and snapshot changes until interrupted (default)
    Watch,

    /// List snapshots, or the versions of one file
    History {
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,

        /// Only snapshots taken at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only snapshots taken at or before this time (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },

    /// Show a file as of a snapshot and how it differs from the current file
    Show {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[arg(value_name = "SNAPSHOT")]
        commit: String,

        #[arg(long, default_value = "myers", help = "Diff algorithm")]
        algorithm: DiffAlgorithmType,
    },

    /// Restore files (or the whole tree) to a snapshot
    Restore {
        #[arg(value_name = "FILE")]
        files: Vec<PathBuf>,

        /// Snapshot to restore
        #[arg(long, value_name = "SNAPSHOT")]
        to: String,

        /// Restore every file in the tree
        #[arg(long, conflicts_with = "files")]
        all: bool,
    },

    /// Engine state: pending paths, queues, snapshot count
    Status,

    /// Rebuild the history index from the repository log
    Rebuild,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// One JSON document per line for scripting
    Json,
}

impl Cli {
    pub fn get_watch_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }

    /// File arguments are relative to the directory the command runs in, not
    /// to the watched root.
    pub fn resolve_file(&self, file: &Path) -> PathBuf {
        let cwd = std::env::current_dir().unwrap_or_default();
        resolve_against(&cwd, file)
    }

    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Watch)
    }

    pub fn setup_logging(&self) {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }

    /// Configuration file and environment, with command-line flags on top.
    pub fn to_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::load(self.config.as_deref())?;

        if let Some(ms) = self.quiet_ms {
            config.debounce.quiet_ms = ms;
        }
        if let Some(secs) = self.max_window_secs {
            config.debounce.max_window_secs = secs;
        }
        if let Some(patterns) = &self.ignore {
            config.watcher.ignore.extend(patterns.iter().cloned());
        }
        if self.paused {
            config.commit.active = false;
        }

        config.validate().map_err(|err| anyhow!(err))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        let path = self.get_watch_path();

        if !path.exists() {
            return Err(format!("Path does not exist: {}", path.display()));
        }

        if !path.is_dir() {
            return Err(format!("Path is not a directory: {}", path.display()));
        }

        if self.quiet_ms == Some(0) {
            return Err("Quiet interval must be greater than 0".to_string());
        }

        if let Some(Commands::Restore { files, all, .. }) = &self.command {
            if files.is_empty() && !all {
                return Err("Name the files to restore or pass --all".to_string());
            }
        }

        Ok(())
    }
}

/// Join `file` onto `base` and fold `.` and `..` lexically, so a file may be
/// named from a sibling directory of the watched tree.
fn resolve_against(base: &Path, file: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    for component in base.join(file).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other),
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_watch() {
        let cli = Cli::parse_from(["file-control", "/tmp"]);
        assert!(matches!(cli.command(), Commands::Watch));
        assert_eq!(cli.get_watch_path(), PathBuf::from("/tmp"));
    }

    #[test]
    fn test_flag_overrides_reach_config() {
        let cli = Cli::parse_from([
            "file-control",
            "--quiet-ms",
            "500",
            "--max-window-secs",
            "10",
            "--ignore",
            "*.tmp,build/",
            "--paused",
        ]);
        let config = cli.to_config().unwrap();

        assert!(!config.commit.active);
        assert_eq!(config.debounce.quiet_ms, 500);
        assert_eq!(config.debounce.max_window_secs, 10);
        assert!(config.watcher.ignore.contains(&"*.tmp".to_string()));
        assert!(config.watcher.ignore.contains(&"build/".to_string()));
    }

    #[test]
    fn test_restore_needs_targets() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().to_str().unwrap();

        let cli = Cli::parse_from(["file-control", path, "restore", "--to", "abcd1234"]);
        assert!(cli.validate().is_err());

        let cli = Cli::parse_from(["file-control", path, "restore", "--to", "abcd1234", "--all"]);
        assert!(cli.validate().is_ok());

        let cli = Cli::parse_from(["file-control", path, "restore", "notes.txt", "--to", "abcd1234"]);
        match cli.command() {
            Commands::Restore { files, to, all } => {
                assert_eq!(files, vec![PathBuf::from("notes.txt")]);
                assert_eq!(to, "abcd1234");
                assert!(!all);
            }
            other => panic!("Expected restore, got {:?}", other),
        }
    }

    #[test]
    fn test_file_arguments_follow_working_directory() {
        let root = Path::new("/home/sam/docs");
        let cwd = root.join("letters");

        assert_eq!(
            resolve_against(&cwd, Path::new("draft.txt")),
            PathBuf::from("/home/sam/docs/letters/draft.txt")
        );
        assert_eq!(
            resolve_against(&cwd, Path::new("../notes.txt")),
            PathBuf::from("/home/sam/docs/notes.txt")
        );
        assert_eq!(
            resolve_against(&cwd, Path::new("/home/sam/docs/a.txt")),
            PathBuf::from("/home/sam/docs/a.txt")
        );
    }
}
