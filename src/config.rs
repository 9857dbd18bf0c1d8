//! Configuration module for Sealdrop.

use serde::Deserialize;
use std::path::Path;

use crate::transfer::{MAX_LIFETIME_HOURS, MIN_LIFETIME_HOURS};
use crate::{Result, SealdropError};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/sealdrop.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Ciphertext blob storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the blob tree.
    #[serde(default = "default_storage_path")]
    pub path: String,
    /// Storage quota for all live transfers, in megabytes.
    #[serde(default = "default_quota_mb")]
    pub quota_mb: u64,
}

fn default_storage_path() -> String {
    "data/blobs".to_string()
}

fn default_quota_mb() -> u64 {
    1024
}

impl StorageConfig {
    /// Quota in bytes.
    pub fn quota_bytes(&self) -> i64 {
        i64::try_from(self.quota_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            quota_mb: default_quota_mb(),
        }
    }
}

/// Public identifier obfuscation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IdsConfig {
    /// Salt keying the identifier permutation. Changing it invalidates every
    /// identifier handed out before.
    #[serde(default = "default_id_salt")]
    pub salt: String,
}

fn default_id_salt() -> String {
    "sealdrop-development-salt".to_string()
}

impl Default for IdsConfig {
    fn default() -> Self {
        Self {
            salt: default_id_salt(),
        }
    }
}

/// Transfer lifetime bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct TransfersConfig {
    /// Shortest lifetime a sender may request.
    #[serde(default = "default_min_lifetime")]
    pub min_lifetime_hours: i64,
    /// Longest lifetime a sender may request.
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_hours: i64,
}

fn default_min_lifetime() -> i64 {
    MIN_LIFETIME_HOURS
}

fn default_max_lifetime() -> i64 {
    MAX_LIFETIME_HOURS
}

impl Default for TransfersConfig {
    fn default() -> Self {
        Self {
            min_lifetime_hours: default_min_lifetime(),
            max_lifetime_hours: default_max_lifetime(),
        }
    }
}

/// Deletion job queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// How often the worker polls for due jobs.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Base delay before a failed job is retried (multiplied by attempts).
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
    /// Attempts after which a job is parked for operator attention.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    /// Maximum jobs claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_retry_backoff() -> u64 {
    60
}

fn default_max_attempts() -> i64 {
    10
}

fn default_batch_size() -> i64 {
    64
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            retry_backoff_secs: default_retry_backoff(),
            max_attempts: default_max_attempts(),
            batch_size: default_batch_size(),
        }
    }
}

/// Orphaned blob sweep configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    /// Blobs without a metadata record are only removed once older than this.
    #[serde(default = "default_orphan_grace")]
    pub orphan_grace_secs: u64,
    /// Seconds between reconciliation passes of the daemon.
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,
}

fn default_orphan_grace() -> u64 {
    3600
}

fn default_reaper_interval() -> u64 {
    3600
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            orphan_grace_secs: default_orphan_grace(),
            interval_secs: default_reaper_interval(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/sealdrop.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Blob storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Identifier codec configuration.
    #[serde(default)]
    pub ids: IdsConfig,
    /// Transfer lifetime bounds.
    #[serde(default)]
    pub transfers: TransfersConfig,
    /// Deletion scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Orphan reaper configuration.
    #[serde(default)]
    pub reaper: ReaperConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(SealdropError::Io)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| SealdropError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `SEALDROP_ID_SALT`: Override the identifier salt
    /// - `SEALDROP_QUOTA_MB`: Override the storage quota
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(salt) = var("SEALDROP_ID_SALT") {
            if !salt.is_empty() {
                self.ids.salt = salt;
            }
        }

        if let Some(quota) = var("SEALDROP_QUOTA_MB") {
            self.storage.quota_mb = quota.trim().parse().map_err(|_| {
                SealdropError::Config(format!("SEALDROP_QUOTA_MB is not a number: {quota:?}"))
            })?;
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.ids.salt.is_empty() {
            return Err(SealdropError::Config(
                "ids.salt must not be empty. \
                 Set it in config.toml or via SEALDROP_ID_SALT environment variable."
                    .to_string(),
            ));
        }

        if self.storage.quota_mb == 0 {
            return Err(SealdropError::Config(
                "storage.quota_mb must be greater than zero".to_string(),
            ));
        }

        let min = self.transfers.min_lifetime_hours;
        let max = self.transfers.max_lifetime_hours;
        if min < MIN_LIFETIME_HOURS || max > MAX_LIFETIME_HOURS || min > max {
            return Err(SealdropError::Config(format!(
                "transfer lifetime bounds must satisfy {MIN_LIFETIME_HOURS} <= min <= max <= {MAX_LIFETIME_HOURS} (got {min}..={max})"
            )));
        }

        if self.scheduler.max_attempts < 1 || self.scheduler.batch_size < 1 {
            return Err(SealdropError::Config(
                "scheduler.max_attempts and scheduler.batch_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.database.path, "data/sealdrop.db");
        assert_eq!(config.storage.path, "data/blobs");
        assert_eq!(config.storage.quota_mb, 1024);
        assert_eq!(config.storage.quota_bytes(), 1024 * 1024 * 1024);
        assert!(!config.ids.salt.is_empty());
        assert_eq!(config.transfers.min_lifetime_hours, 1);
        assert_eq!(config.transfers.max_lifetime_hours, 24);
        assert_eq!(config.scheduler.poll_interval_secs, 30);
        assert_eq!(config.scheduler.retry_backoff_secs, 60);
        assert_eq!(config.scheduler.max_attempts, 10);
        assert_eq!(config.scheduler.batch_size, 64);
        assert_eq!(config.reaper.orphan_grace_secs, 3600);
        assert_eq!(config.reaper.interval_secs, 3600);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, "logs/sealdrop.log");

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[database]
path = "custom/db.sqlite"

[storage]
path = "custom/blobs"
quota_mb = 20

[ids]
salt = "pepper"

[transfers]
min_lifetime_hours = 2
max_lifetime_hours = 12

[scheduler]
poll_interval_secs = 5
retry_backoff_secs = 10
max_attempts = 3
batch_size = 8

[reaper]
orphan_grace_secs = 60
interval_secs = 300

[logging]
level = "debug"
file = "custom/logs/app.log"
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.database.path, "custom/db.sqlite");
        assert_eq!(config.storage.path, "custom/blobs");
        assert_eq!(config.storage.quota_bytes(), 20 * 1024 * 1024);
        assert_eq!(config.ids.salt, "pepper");
        assert_eq!(config.transfers.min_lifetime_hours, 2);
        assert_eq!(config.transfers.max_lifetime_hours, 12);
        assert_eq!(config.scheduler.poll_interval_secs, 5);
        assert_eq!(config.scheduler.retry_backoff_secs, 10);
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.scheduler.batch_size, 8);
        assert_eq!(config.reaper.orphan_grace_secs, 60);
        assert_eq!(config.reaper.interval_secs, 300);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config_uses_defaults() {
        let config = Config::parse("[storage]\nquota_mb = 5\n").unwrap();

        assert_eq!(config.storage.quota_mb, 5);
        assert_eq!(config.storage.path, "data/blobs");
        assert_eq!(config.database.path, "data/sealdrop.db");
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = Config::default();
        config
            .apply_overrides(|name| match name {
                "SEALDROP_ID_SALT" => Some("from-env".to_string()),
                "SEALDROP_QUOTA_MB" => Some("64".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.ids.salt, "from-env");
        assert_eq!(config.storage.quota_mb, 64);
    }

    #[test]
    fn test_unparsable_quota_override_is_an_error() {
        let mut config = Config::default();
        let result = config.apply_overrides(|name| {
            (name == "SEALDROP_QUOTA_MB").then(|| "lots".to_string())
        });

        assert!(matches!(result, Err(SealdropError::Config(_))));
        assert_eq!(config.storage.quota_mb, 1024);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = Config::parse("[storage\nquota_mb = ");
        assert!(matches!(result, Err(SealdropError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_salt() {
        let mut config = Config::default();
        config.ids.salt.clear();
        assert!(matches!(config.validate(), Err(SealdropError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_quota() {
        let mut config = Config::default();
        config.storage.quota_mb = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_lifetime_bounds() {
        let mut config = Config::default();
        config.transfers.max_lifetime_hours = 48;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transfers.min_lifetime_hours = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transfers.min_lifetime_hours = 10;
        config.transfers.max_lifetime_hours = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/sealdrop.toml");
        assert!(matches!(result, Err(SealdropError::Io(_))));
    }
}
