// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ledger: LedgerConfig,
    pub sync: SyncConfig,
    pub packages: PackagesConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    /// JSON array of job records loaded into the in-memory ledger at startup
    pub seed_file: Option<PathBuf>,
    pub database: DatabaseConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Memory,
            seed_file: None,
            database: DatabaseConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/snippet_cron".to_string(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_seconds: u64,
    /// Re-materialize every ledger record once at startup
    pub full_resync_on_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 3600,
            full_resync_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    /// argv prefix; package names are appended
    pub install_command: Vec<String>,
    /// argv printing one installed package per line
    pub list_command: Vec<String>,
    pub module_dir: PathBuf,
    pub settle_delay_ms: u64,
}

impl PackagesConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            install_command: vec![
                "sh".to_string(),
                "tools/packages.sh".to_string(),
                "install".to_string(),
            ],
            list_command: vec![
                "sh".to_string(),
                "tools/packages.sh".to_string(),
                "list".to_string(),
            ],
            module_dir: PathBuf::from("packages"),
            settle_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Per-job wall-clock limit; 0 disables it
    pub timeout_seconds: u64,
    /// Per-job operation limit; 0 disables it
    pub max_operations: u64,
}

impl WorkerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            timeout_seconds: 0,
            max_operations: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    /// Timezone for records that do not name one
    pub default_timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            default_timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            metrics_port: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("packages.install_command")
                    .with_list_parse_key("packages.list_command")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.ledger.backend == LedgerBackend::Postgres {
            if self.ledger.database.url.is_empty() {
                return Err("Database URL cannot be empty".to_string());
            }
            if self.ledger.database.max_connections == 0 {
                return Err("Database max_connections must be greater than 0".to_string());
            }
        }

        if self.sync.interval_seconds == 0 {
            return Err("Sync interval_seconds must be greater than 0".to_string());
        }

        if self.packages.install_command.is_empty() {
            return Err("Package install_command cannot be empty".to_string());
        }
        if self.packages.list_command.is_empty() {
            return Err("Package list_command cannot be empty".to_string());
        }

        if self.worker.concurrency == 0 {
            return Err("Worker concurrency must be greater than 0".to_string());
        }

        if self.scheduler.tick_interval_ms == 0 {
            return Err("Scheduler tick_interval_ms must be greater than 0".to_string());
        }
        if self.scheduler.default_timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(format!(
                "Unknown default timezone '{}'",
                self.scheduler.default_timezone
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_zero_concurrency() {
        let mut settings = Settings::default();
        settings.worker.concurrency = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_empty_install_command() {
        let mut settings = Settings::default();
        settings.packages.install_command.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_unknown_timezone() {
        let mut settings = Settings::default();
        settings.scheduler.default_timezone = "Mars/Olympus".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_postgres_backend_requires_url() {
        let mut settings = Settings::default();
        settings.ledger.backend = LedgerBackend::Postgres;
        settings.ledger.database.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_disables_limit() {
        let mut worker = WorkerConfig::default();
        assert_eq!(worker.timeout(), None);
        worker.timeout_seconds = 30;
        assert_eq!(worker.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "[worker]\nconcurrency = 9\n\n[sync]\ninterval_seconds = 60\n",
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.worker.concurrency, 9);
        assert_eq!(settings.sync.interval_seconds, 60);
        assert_eq!(settings.packages.settle_delay_ms, 2000);
    }
}
