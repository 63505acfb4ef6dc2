// ⚙️ Configuration - Sync engine & server settings
// Loaded from an optional TOML file; every field has a default so an empty
// file (or no file at all) yields a working configuration.

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resources watched and replayed on catch-up, in this order
pub const DEFAULT_RESOURCES: [&str; 6] = [
    "products",
    "sales",
    "pretfamilles",
    "pretproduits",
    "depensedumois",
    "depensefixe",
];

// ============================================================================
// WATCH STRATEGY
// ============================================================================

/// How storage mutations are noticed. Exactly one strategy runs per watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchStrategy {
    /// OS file-change notifications (inotify / FSEvents / ReadDirectoryChangesW)
    Events,

    /// Periodic stat of every watched file, for platforms without reliable
    /// change notification
    Poll,
}

impl Default for WatchStrategy {
    fn default() -> Self {
        WatchStrategy::Events
    }
}

// ============================================================================
// SYNC CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory holding one `<resource>.json` file per resource
    pub data_dir: PathBuf,

    /// Resource names (file stems) to watch
    pub resources: Vec<String>,

    /// Wait before re-reading a resource after a mutation signal
    pub settle_delay_ms: u64,

    /// Heartbeat period per subscriber
    pub heartbeat_interval_secs: u64,

    /// Ceiling after which an idle push connection is force-closed
    pub connection_timeout_secs: u64,

    pub watch_strategy: WatchStrategy,

    /// Only used with `WatchStrategy::Poll`
    pub poll_interval_ms: u64,

    /// Sale lines whose description contains this keyword leave stock untouched
    pub stock_exempt_keyword: String,

    /// Server listen address
    pub bind: String,

    /// Default tracing filter, overridden by RUST_LOG
    pub log_level: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            data_dir: PathBuf::from("db"),
            resources: DEFAULT_RESOURCES.iter().map(|r| r.to_string()).collect(),
            settle_delay_ms: 100,
            heartbeat_interval_secs: 30,
            connection_timeout_secs: 300,
            watch_strategy: WatchStrategy::Events,
            poll_interval_ms: 1000,
            stock_exempt_keyword: "avance".to_string(),
            bind: "0.0.0.0:3001".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config TOML")
    }

    /// Load from file if given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();

        assert_eq!(config.resources.len(), 6);
        assert_eq!(config.settle_delay(), Duration::from_millis(100));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.connection_timeout(), Duration::from_secs(300));
        assert_eq!(config.watch_strategy, WatchStrategy::Events);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            data_dir = "/srv/shop/db"
            settle_delay_ms = 50
            watch_strategy = "poll"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/shop/db"));
        assert_eq!(config.settle_delay_ms, 50);
        assert_eq!(config.watch_strategy, WatchStrategy::Poll);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.stock_exempt_keyword, "avance");
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(SyncConfig::from_toml_str("settle_delay_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_load_without_path() {
        let config = SyncConfig::load(None).unwrap();
        assert_eq!(config.bind, "0.0.0.0:3001");
    }
}
