//! Layered configuration loading and validation.

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Log level is not one of trace, debug, info, warn, error.
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    /// Log format is neither json nor pretty.
    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    /// `database.path` is empty.
    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    /// Pool size out of range.
    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    /// Archive URL is not http(s).
    #[error("Invalid archive url: {0}. Must start with http:// or https://")]
    InvalidArchiveUrl(String),

    /// A size or interval that must be positive is zero.
    #[error("Invalid {0}: must be greater than zero")]
    ZeroValue(&'static str),

    /// Any other invalid setting.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .medai/config.yaml (project config, created by init)
    /// 3. .medai/local.yaml (local overrides, optional)
    /// 4. Environment variables (MEDAI_* prefix, `__` separates sections)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".medai/config.yaml"))
            .merge(Yaml::file(".medai/local.yaml"))
            .merge(Env::prefixed("MEDAI_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("MEDAI_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }

        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(
                config.database.max_connections,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let url = &config.archive.url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidArchiveUrl(url.clone()));
        }
        if config.archive.timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("archive.timeout_secs"));
        }

        if config.dispatcher.engine.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "dispatcher.engine cannot be empty".to_string(),
            ));
        }
        if config.dispatcher.images_volume.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "dispatcher.images_volume cannot be empty".to_string(),
            ));
        }

        let scheduler = &config.scheduler;
        for (name, value) in [
            ("scheduler.tick_interval_ms", scheduler.tick_interval_ms),
            ("scheduler.eval_jobs_secs", scheduler.eval_jobs_secs),
            ("scheduler.classify_secs", scheduler.classify_secs),
            ("scheduler.experiments_secs", scheduler.experiments_secs),
            ("scheduler.warm_workers_secs", scheduler.warm_workers_secs),
            ("scheduler.archive_gc_secs", scheduler.archive_gc_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroValue(name));
            }
        }

        if config.orchestrator.classification_batch_size == 0 {
            return Err(ConfigError::ZeroValue("orchestrator.classification_batch_size"));
        }
        if config.orchestrator.experiment_batch_size == 0 {
            return Err(ConfigError::ZeroValue("orchestrator.experiment_batch_size"));
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
        assert_eq!(config.database.path, ".medai/medai.db");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.archive.url, "http://localhost:8042");
        assert_eq!(config.orchestrator.classification_batch_size, 5);
        assert!(config.orchestrator.retries_share_batch_cap);
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
database:
  path: /custom/path.db
  max_connections: 5
logging:
  level: debug
  format: pretty
  retention_days: 7
archive:
  url: https://orthanc.internal
dispatcher:
  engine: podman
  network: medai
  gpus: false
orchestrator:
  retries_share_batch_cap: false
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.database.path, "/custom/path.db");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.archive.url, "https://orthanc.internal");
        assert_eq!(config.archive.timeout_secs, 60);
        assert_eq!(config.dispatcher.engine, "podman");
        assert_eq!(config.dispatcher.network.as_deref(), Some("medai"));
        assert!(!config.dispatcher.gpus);
        assert!(!config.orchestrator.retries_share_batch_cap);
        assert_eq!(config.scheduler.eval_jobs_secs, 10);

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();

        match ConfigLoader::validate(&config).unwrap_err() {
            ConfigError::InvalidLogLevel(level) => assert_eq!(level, "invalid"),
            other => panic!("Expected InvalidLogLevel error, got {other}"),
        }
    }

    #[test]
    fn test_validate_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();

        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidLogFormat(_)
        ));
    }

    #[test]
    fn test_validate_empty_database_path() {
        let mut config = Config::default();
        config.database.path = String::new();

        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::EmptyDatabasePath
        ));
    }

    #[test]
    fn test_validate_zero_max_connections() {
        let mut config = Config::default();
        config.database.max_connections = 0;

        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidMaxConnections(0)
        ));
    }

    #[test]
    fn test_validate_archive_url() {
        let mut config = Config::default();
        config.archive.url = "orthanc:8042".to_string();

        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidArchiveUrl(_)
        ));
    }

    #[test]
    fn test_validate_zero_interval() {
        let mut config = Config::default();
        config.scheduler.classify_secs = 0;

        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::ZeroValue("scheduler.classify_secs")
        ));
    }

    #[test]
    fn test_validate_zero_batch_size() {
        let mut config = Config::default();
        config.orchestrator.experiment_batch_size = 0;

        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::ZeroValue("orchestrator.experiment_batch_size")
        ));
    }

    #[test]
    fn test_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "logging:\n  level: warn\n").unwrap();

        temp_env::with_vars(
            [
                ("MEDAI_LOGGING__LEVEL", Some("debug")),
                ("MEDAI_ORCHESTRATOR__EXPERIMENT_BATCH_SIZE", Some("3")),
                ("MEDAI_ARCHIVE__URL", Some("http://orthanc:8042")),
            ],
            || {
                let config = ConfigLoader::load_from_file(&path).unwrap();
                assert_eq!(config.logging.level, "debug", "env should beat file");
                assert_eq!(config.orchestrator.experiment_batch_size, 3);
                assert_eq!(config.archive.url, "http://orthanc:8042");
            },
        );
    }

    #[test]
    fn test_hierarchical_merging() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut base_file = NamedTempFile::new().unwrap();
        writeln!(
            base_file,
            "scheduler:\n  eval_jobs_secs: 30\nlogging:\n  level: info\n  format: json"
        )
        .unwrap();
        base_file.flush().unwrap();

        let mut override_file = NamedTempFile::new().unwrap();
        writeln!(override_file, "scheduler:\n  eval_jobs_secs: 5\nlogging:\n  level: debug").unwrap();
        override_file.flush().unwrap();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base_file.path()))
            .merge(Yaml::file(override_file.path()))
            .extract()
            .unwrap();

        assert_eq!(config.scheduler.eval_jobs_secs, 5, "Override should win");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.logging.format, "json",
            "Base value should persist when not overridden"
        );
        assert_eq!(config.scheduler.classify_secs, 15);
    }
}
