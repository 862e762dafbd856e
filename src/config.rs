//! Configuration management for file-control
//!
//! Defaults are overridden, in order, by an optional TOML file, by
//! `FILE_CONTROL_*` environment variables and finally by command line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Global configuration for the snapshot engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// File event source configuration
    pub watcher: WatcherConfig,
    /// Change debouncer configuration
    pub debounce: DebounceConfig,
    /// Snapshot committer configuration
    pub commit: CommitConfig,
    /// Pipeline queue configuration
    pub queues: QueueConfig,
    /// History index configuration
    pub history: HistoryConfig,
}

/// Configuration for the file event source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Interval between reconciliation scans in seconds
    pub reconcile_interval_secs: u64,
    /// How often to check that the watched root still exists, in milliseconds
    pub root_check_interval_ms: u64,
    /// How long restored paths stay suppressed after the restore finished
    pub suppression_grace_ms: u64,
    /// Extra gitignore-style patterns to leave out of the history
    pub ignore: Vec<String>,
    /// Honour the tree's own .gitignore
    pub respect_gitignore: bool,
}

/// Configuration for change coalescing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Quiet interval that closes a window, in milliseconds
    pub quiet_ms: u64,
    /// Maximum time a window may stay open, in seconds
    pub max_window_secs: u64,
}

/// Configuration for snapshot commits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Total commit attempts before a change set is reported as failed
    pub retry_limit: u32,
    /// First retry delay in milliseconds; doubles on every attempt
    pub backoff_base_ms: u64,
    /// Upper bound for the retry delay in milliseconds
    pub backoff_max_ms: u64,
    pub author_name: String,
    pub author_email: String,
    /// Take snapshots automatically; when false the engine starts paused
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue depth at which a backpressure condition is raised
    pub high_water_mark: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Persist the history index between runs
    pub cache_enabled: bool,
    /// Cache location, relative to the repository metadata directory
    pub cache_file: PathBuf,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 30,
            root_check_interval_ms: 1000,
            suppression_grace_ms: 500,
            ignore: Vec::new(),
            respect_gitignore: true,
        }
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_ms: 2000,
            max_window_secs: 30,
        }
    }
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 8000,
            author_name: "file-control".to_string(),
            author_email: "file-control@localhost".to_string(),
            active: true,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 1024,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_file: PathBuf::from("file-control/history.json"),
        }
    }
}

impl WatcherConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn root_check_interval(&self) -> Duration {
        Duration::from_millis(self.root_check_interval_ms)
    }

    pub fn suppression_grace(&self) -> Duration {
        Duration::from_millis(self.suppression_grace_ms)
    }
}

impl DebounceConfig {
    /// Get quiet interval duration
    pub fn quiet_duration(&self) -> Duration {
        Duration::from_millis(self.quiet_ms)
    }

    /// Get maximum window duration
    pub fn max_window_duration(&self) -> Duration {
        Duration::from_secs(self.max_window_secs)
    }
}

impl CommitConfig {
    /// Delay before the retry that follows attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.backoff_max_ms),
        )
    }
}

/// Configuration loading and management
impl EngineConfig {
    /// Defaults, then the optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Some(ms) = env_number("FILE_CONTROL_QUIET_MS") {
            self.debounce.quiet_ms = ms;
        }

        if let Some(secs) = env_number("FILE_CONTROL_MAX_WINDOW_SECS") {
            self.debounce.max_window_secs = secs;
        }

        if let Some(limit) = env_number("FILE_CONTROL_RETRY_LIMIT") {
            self.commit.retry_limit = limit;
        }

        if let Some(mark) = env_number("FILE_CONTROL_HIGH_WATER_MARK") {
            self.queues.high_water_mark = mark;
        }

        if let Some(active) = env_number("FILE_CONTROL_ACTIVE") {
            self.commit.active = active;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.debounce.quiet_ms == 0 {
            return Err("quiet_ms must be greater than 0".to_string());
        }

        if self.debounce.max_window_duration() < self.debounce.quiet_duration() {
            return Err("max_window_secs must not be shorter than quiet_ms".to_string());
        }

        if self.commit.retry_limit == 0 {
            return Err("retry_limit must be greater than 0".to_string());
        }

        if self.queues.high_water_mark == 0 {
            return Err("high_water_mark must be greater than 0".to_string());
        }

        if self.watcher.reconcile_interval_secs == 0 || self.watcher.root_check_interval_ms == 0 {
            return Err("watcher intervals must be greater than 0".to_string());
        }

        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Ignoring {}: cannot parse {:?}", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();

        assert_eq!(config.debounce.quiet_ms, 2000);
        assert_eq!(config.debounce.max_window_secs, 30);
        assert_eq!(config.commit.retry_limit, 3);
        assert_eq!(config.queues.high_water_mark, 1024);
        assert!(config.history.cache_enabled);
        assert!(config.commit.active);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());

        config.debounce.quiet_ms = 0;
        assert!(config.validate().is_err());

        config.debounce.quiet_ms = 5000;
        config.debounce.max_window_secs = 2;
        assert!(config.validate().is_err());

        config.debounce.max_window_secs = 30;
        config.commit.retry_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_conversions() {
        let config = EngineConfig::default();

        assert_eq!(config.debounce.quiet_duration(), Duration::from_secs(2));
        assert_eq!(config.debounce.max_window_duration(), Duration::from_secs(30));
        assert_eq!(config.watcher.suppression_grace(), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let commit = CommitConfig::default();

        assert_eq!(commit.backoff(1), Duration::from_millis(250));
        assert_eq!(commit.backoff(2), Duration::from_millis(500));
        assert_eq!(commit.backoff(3), Duration::from_millis(1000));
        assert_eq!(commit.backoff(10), Duration::from_millis(8000));
    }

    #[test]
    fn test_partial_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file-control.toml");
        std::fs::write(
            &path,
            "[debounce]\nquiet_ms = 500\n\n[watcher]\nignore = [\"*.tmp\"]\n",
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();

        assert_eq!(config.debounce.quiet_ms, 500);
        assert_eq!(config.debounce.max_window_secs, 30);
        assert_eq!(config.watcher.ignore, vec!["*.tmp".to_string()]);
        assert_eq!(config.commit, CommitConfig::default());
    }

    #[test]
    fn test_env_config_loading() {
        std::env::set_var("FILE_CONTROL_MAX_WINDOW_SECS", "45");
        std::env::set_var("FILE_CONTROL_HIGH_WATER_MARK", "64");

        let config = EngineConfig::from_env();

        assert_eq!(config.debounce.max_window_secs, 45);
        assert_eq!(config.queues.high_water_mark, 64);

        // Cleanup
        std::env::remove_var("FILE_CONTROL_MAX_WINDOW_SECS");
        std::env::remove_var("FILE_CONTROL_HIGH_WATER_MARK");
    }
}
