//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml, or the
//!    file named by `PGDUMP_S3_CONFIG`)
//! 3. Environment variables (override)
//!
//! The resulting `AppConfig` is immutable and validated once at startup.
//! Every missing required value is reported together.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::replication::{MAX_PART_SIZE, MIN_PART_SIZE};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub schedule: ScheduleConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub dump: DumpConfig,
    pub backup: BackupConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Job trigger configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Cron expression, 5 fields or Quartz-style 6/7 fields (UTC)
    #[serde(default)]
    pub cron: String,
    /// Run one backup immediately on startup
    pub run_on_start: bool,
    /// How long a running backup may finish after shutdown is requested
    pub drain_timeout_seconds: u64,
}

/// S3-compatible storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Service URL (e.g., "https://s3.eu-central-1.amazonaws.com")
    #[serde(default)]
    pub endpoint: String,
    /// Signing region
    pub region: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub bucket: String,
    /// Key prefix for every object written (trailing slashes ignored)
    #[serde(default)]
    pub prefix: String,
    /// Use path-style addressing (required by most self-hosted stores)
    pub force_path_style: bool,
    /// Bytes per part for multipart copy and upload
    pub part_size: u64,
    /// Maximum part copies in flight
    pub copy_concurrency: usize,
    /// Artifacts larger than this are uploaded in parts
    pub multipart_threshold: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `Host=..;Port=..;Database=..;Username=..;Password=..` or a postgres:// URL
    #[serde(default)]
    pub connection_string: String,
}

/// Dump tool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DumpConfig {
    /// Executable to run (default: "pg_dump")
    pub program: String,
    /// Extra arguments, whitespace separated
    #[serde(default)]
    pub extra_args: String,
    /// Directory for temporary dump artifacts (default: system temp dir)
    pub work_dir: Option<PathBuf>,
}

impl DumpConfig {
    /// Extra arguments with empty entries dropped
    pub fn extra_args(&self) -> Vec<String> {
        self.extra_args
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

/// Backup object naming
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// Fixed offset applied to the UTC timestamp in backup keys.
    ///
    /// Deployments that want keys in local time set this explicitly; the
    /// offset is rendered into the key, e.g. `+03:00`.
    pub timestamp_offset_hours: i32,
    /// Suffix appended to both the timestamped and latest keys
    #[serde(default)]
    pub object_extension: String,
}

/// Health and metrics endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from files and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. File named by `PGDUMP_S3_CONFIG` (if set)
    /// 5. Environment variables (PGDUMP_S3__*)
    ///
    /// # Errors
    /// Returns `ConfigurationMissing` listing every absent required value,
    /// or `Config` if a value is out of range.
    pub fn load() -> Result<Self, AppError> {
        use config::{Environment, File};

        let mut builder = Self::defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false));

        if let Ok(path) = std::env::var("PGDUMP_S3_CONFIG") {
            builder = builder.add_source(File::with_name(&path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("PGDUMP_S3")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Load configuration from a single file on top of the defaults
    pub fn load_from_file(path: &Path) -> Result<Self, AppError> {
        let config = Self::defaults()?
            .add_source(config::File::from(path).required(true))
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, AppError> {
        let builder = config::Config::builder()
            .set_default("schedule.run_on_start", false)?
            .set_default("schedule.drain_timeout_seconds", 3600)?
            .set_default("storage.region", "us-east-1")?
            .set_default("storage.force_path_style", true)?
            .set_default("storage.part_size", MIN_PART_SIZE)?
            .set_default("storage.copy_concurrency", 4)?
            .set_default("storage.multipart_threshold", 64 * 1024 * 1024)?
            .set_default("database.connection_string", "")?
            .set_default("dump.program", "pg_dump")?
            .set_default("backup.timestamp_offset_hours", 0)?
            .set_default("backup.object_extension", ".backup")?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.host", "127.0.0.1")?
            .set_default("metrics.port", 9187)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?;
        Ok(builder)
    }

    pub(crate) fn validate(&self) -> Result<(), AppError> {
        let required = [
            ("schedule.cron", &self.schedule.cron),
            ("storage.endpoint", &self.storage.endpoint),
            ("storage.access_key_id", &self.storage.access_key_id),
            ("storage.secret_access_key", &self.storage.secret_access_key),
            ("storage.bucket", &self.storage.bucket),
            ("storage.prefix", &self.storage.prefix),
            ("database.connection_string", &self.database.connection_string),
        ];

        let missing: Vec<String> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(AppError::ConfigurationMissing { fields: missing });
        }

        if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&self.storage.part_size) {
            return Err(AppError::Config(format!(
                "storage.part_size must be between {} and {} bytes",
                MIN_PART_SIZE, MAX_PART_SIZE
            )));
        }

        if self.storage.copy_concurrency == 0 {
            return Err(AppError::Config(
                "storage.copy_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.storage.multipart_threshold == 0 {
            return Err(AppError::Config(
                "storage.multipart_threshold must be greater than 0".to_string(),
            ));
        }

        if !(-23..=23).contains(&self.backup.timestamp_offset_hours) {
            return Err(AppError::Config(
                "backup.timestamp_offset_hours must be between -23 and 23".to_string(),
            ));
        }

        url::Url::parse(&self.storage.endpoint).map_err(|error| {
            AppError::Config(format!("storage.endpoint is not a valid URL: {}", error))
        })?;

        crate::scheduler::parse_schedule(&self.schedule.cron)?;
        crate::dump::ConnectionParams::parse(&self.database.connection_string)?;

        if self.backup.timestamp_offset_hours != 0 {
            tracing::warn!(
                offset_hours = self.backup.timestamp_offset_hours,
                "Backup keys use a non-UTC timestamp offset"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            schedule: ScheduleConfig {
                cron: "0 3 * * *".to_string(),
                run_on_start: false,
                drain_timeout_seconds: 3600,
            },
            storage: StorageConfig {
                endpoint: "http://localhost:9000".to_string(),
                region: "us-east-1".to_string(),
                access_key_id: "access-key".to_string(),
                secret_access_key: "secret-key".to_string(),
                bucket: "backups".to_string(),
                prefix: "postgres/".to_string(),
                force_path_style: true,
                part_size: MIN_PART_SIZE,
                copy_concurrency: 4,
                multipart_threshold: 64 * 1024 * 1024,
            },
            database: DatabaseConfig {
                connection_string:
                    "Host=db;Port=5432;Database=app;Username=postgres;Password=secret"
                        .to_string(),
            },
            dump: DumpConfig {
                program: "pg_dump".to_string(),
                extra_args: "--format=custom  --no-owner".to_string(),
                work_dir: None,
            },
            backup: BackupConfig {
                timestamp_offset_hours: 0,
                object_extension: ".backup".to_string(),
            },
            metrics: MetricsConfig {
                enabled: false,
                host: "127.0.0.1".to_string(),
                port: 9187,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_complete_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_reports_every_missing_field() {
        let mut config = valid_config();
        config.storage.bucket = String::new();
        config.storage.secret_access_key = "  ".to_string();
        config.database.connection_string = String::new();

        let error = config
            .validate()
            .expect_err("missing values must fail validation");
        match error {
            AppError::ConfigurationMissing { fields } => assert_eq!(
                fields,
                vec![
                    "storage.secret_access_key".to_string(),
                    "storage.bucket".to_string(),
                    "database.connection_string".to_string(),
                ]
            ),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_part_size_below_store_minimum() {
        let mut config = valid_config();
        config.storage.part_size = MIN_PART_SIZE - 1;

        let error = config.validate().expect_err("undersized parts must fail");
        assert!(matches!(
            error,
            AppError::Config(message) if message.contains("storage.part_size")
        ));
    }

    #[test]
    fn validate_rejects_invalid_cron() {
        let mut config = valid_config();
        config.schedule.cron = "every night".to_string();

        let error = config.validate().expect_err("bad cron must fail");
        assert!(matches!(error, AppError::Schedule(_)));
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = valid_config();
        config.storage.copy_concurrency = 0;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn extra_args_drop_empty_entries() {
        let config = valid_config();
        assert_eq!(
            config.dump.extra_args(),
            vec!["--format=custom".to_string(), "--no-owner".to_string()]
        );
    }

    #[test]
    fn load_from_file_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pgdump.toml");
        std::fs::write(
            &path,
            r#"
[schedule]
cron = "0 0 3 ? * *"

[storage]
endpoint = "https://s3.example.com"
access_key_id = "key"
secret_access_key = "secret"
bucket = "backups"
prefix = "prod"

[database]
connection_string = "postgres://postgres:secret@db:5432/app"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(config.storage.part_size, MIN_PART_SIZE);
        assert_eq!(config.storage.copy_concurrency, 4);
        assert_eq!(config.dump.program, "pg_dump");
        assert_eq!(config.backup.object_extension, ".backup");
        assert!(config.storage.force_path_style);
    }

    #[test]
    fn load_from_file_reports_missing_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pgdump.toml");
        std::fs::write(&path, "[schedule]\ncron = \"0 3 * * *\"\n").unwrap();

        let error = AppConfig::load_from_file(&path).expect_err("incomplete config");
        match error {
            AppError::ConfigurationMissing { fields } => {
                assert!(fields.contains(&"storage.bucket".to_string()));
                assert!(fields.contains(&"database.connection_string".to_string()));
                assert!(!fields.contains(&"schedule.cron".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
