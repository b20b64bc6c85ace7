//! Runtime configuration.
//!
//! Loaded once from a TOML file (all fields defaulted), then held in an
//! `ArcSwap` by the handler so tunables can be swapped at runtime without
//! restarting in-flight turns.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the dispatch engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Continuity window in minutes for attaching reply-less messages to
    /// recent activity. `0` disables continuity detection.
    pub continuity_window_minutes: u64,

    /// Upper bound on one streamed agent turn, in seconds. `0` disables
    /// the timeout.
    pub turn_timeout_secs: u64,

    /// Fully terminal trees older than this many days may be evicted from
    /// the queue. `0` disables eviction.
    pub retention_days: u64,

    /// Minimum interval between non-terminal status message edits.
    pub status_edit_interval_ms: u64,

    /// SQLite database file backing the tree store.
    pub database_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            continuity_window_minutes: 10,
            turn_timeout_secs: 600,
            retention_days: 30,
            status_edit_interval_ms: 1000,
            database_path: PathBuf::from("treebot.db"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults;
    /// unknown keys are rejected so typos fail loudly.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    pub fn continuity_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.continuity_window_minutes as i64)
    }

    pub fn retention_horizon(&self) -> Option<chrono::Duration> {
        (self.retention_days > 0).then(|| chrono::Duration::days(self.retention_days as i64))
    }

    pub fn turn_timeout(&self) -> Option<std::time::Duration> {
        (self.turn_timeout_secs > 0).then(|| std::time::Duration::from_secs(self.turn_timeout_secs))
    }

    pub fn status_edit_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.status_edit_interval_ms)
    }
}
