//! Configuration for the accounting service

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "ACCOUNTING_";

/// Accounting service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Optional TOML catalog of products and project members
    pub catalog_path: Option<PathBuf>,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Synchronization configuration
    pub sync: SyncConfig,

    /// Actor configuration
    pub actor: ActorConfig,

    /// Log every request/response pair and the full ledger state
    pub verbose_tracing: bool,

    /// Check loaded balances against the transaction history at start-up
    pub verify_on_load: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/accounting"),
            service_name: "accounting-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            catalog_path: None,
            rocksdb: RocksDBConfig::default(),
            sync: SyncConfig::default(),
            actor: ActorConfig::default(),
            verbose_tracing: false,
            verify_on_load: false,
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum time between two synchronization cycles (milliseconds)
    pub interval_ms: u64,

    /// Idle tick on which a due synchronization is attempted (milliseconds)
    pub idle_tick_ms: u64,
}

impl SyncConfig {
    /// Interval between synchronization cycles
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Idle tick
    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms.max(1))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            idle_tick_ms: 500,
        }
    }
}

/// Actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Bounded mailbox capacity (backpressure)
    pub mailbox_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        Config::default().with_env_overrides()
    }

    /// Apply `ACCOUNTING_*` environment overrides
    pub fn with_env_overrides(self) -> crate::Result<Self> {
        self.with_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        if let Some(data_dir) = lookup("DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Some(path) = lookup("CATALOG_PATH") {
            self.catalog_path = Some(PathBuf::from(path));
        }

        if let Some(value) = lookup("SYNC_INTERVAL_MS") {
            self.sync.interval_ms = parse("SYNC_INTERVAL_MS", &value)?;
        }

        if let Some(value) = lookup("MAILBOX_CAPACITY") {
            self.actor.mailbox_capacity = parse("MAILBOX_CAPACITY", &value)?;
        }

        if let Some(value) = lookup("VERBOSE_TRACING") {
            self.verbose_tracing = parse("VERBOSE_TRACING", &value)?;
        }

        if let Some(value) = lookup("VERIFY_ON_LOAD") {
            self.verify_on_load = parse("VERIFY_ON_LOAD", &value)?;
        }

        Ok(self)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        crate::Error::Config(format!("Invalid {}{}={:?}: {}", ENV_PREFIX, key, value, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "accounting-core");
        assert_eq!(config.sync.interval(), Duration::from_secs(30));
        assert_eq!(config.sync.idle_tick(), Duration::from_millis(500));
        assert!(!config.verbose_tracing);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/accounting"
            verbose_tracing = true

            [sync]
            interval_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/accounting"));
        assert!(config.verbose_tracing);
        assert_eq!(config.sync.interval_ms, 1000);
        assert_eq!(config.sync.idle_tick_ms, 500);
        assert_eq!(config.actor.mailbox_capacity, 1000);
    }

    #[test]
    fn test_shipped_config_parses() {
        let config =
            Config::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/../config/accounting.toml"))
                .unwrap();
        assert!(config.verify_on_load);
        assert_eq!(config.catalog_path, Some(PathBuf::from("./config/catalog.toml")));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("DATA_DIR", "/tmp/acc"),
            ("SYNC_INTERVAL_MS", "250"),
            ("VERIFY_ON_LOAD", "true"),
        ]
        .into_iter()
        .collect();

        let config = Config::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/acc"));
        assert_eq!(config.sync.interval_ms, 250);
        assert!(config.verify_on_load);
    }

    #[test]
    fn test_invalid_override() {
        let err = Config::default()
            .with_overrides(|key| (key == "SYNC_INTERVAL_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("ACCOUNTING_SYNC_INTERVAL_MS"));
    }
}
