//! Runner configuration, deserialized by the config loader.

use serde::{Deserialize, Serialize};

/// Main configuration structure for the runner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Imaging archive connection
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Worker container launch settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Periodic driver intervals
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Orchestration policy knobs
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".medai/medai.db".to_string()
}

const fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Number of days to retain logs
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            retention_days: default_retention_days(),
        }
    }
}

/// Imaging archive (Orthanc REST) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ArchiveConfig {
    /// Base URL of the archive REST API
    #[serde(default = "default_archive_url")]
    pub url: String,

    /// Local directory downloaded payloads are written to
    #[serde(default = "default_images_dir")]
    pub images_dir: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_archive_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_archive_url() -> String {
    "http://localhost:8042".to_string()
}

fn default_images_dir() -> String {
    ".medai/images".to_string()
}

const fn default_archive_timeout_secs() -> u64 {
    60
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            url: default_archive_url(),
            images_dir: default_images_dir(),
            timeout_secs: default_archive_timeout_secs(),
        }
    }
}

/// Container dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DispatcherConfig {
    /// Container engine binary (`docker`, `podman`)
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Host volume mounted into workers at `/opt/images`
    #[serde(default = "default_images_dir")]
    pub images_volume: String,

    /// Container network workers join, if any
    #[serde(default)]
    pub network: Option<String>,

    /// Request GPUs for non-CPU jobs
    #[serde(default = "default_true")]
    pub gpus: bool,
}

fn default_engine() -> String {
    "docker".to_string()
}

const fn default_true() -> bool {
    true
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            images_volume: default_images_dir(),
            network: None,
            gpus: true,
        }
    }
}

/// Periodic driver intervals, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Granularity of the driver loop in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Eval job cycle interval.
    #[serde(default = "default_eval_jobs_secs")]
    pub eval_jobs_secs: u64,

    /// Classification sweep interval.
    #[serde(default = "default_classify_secs")]
    pub classify_secs: u64,

    /// Experiment sweep interval.
    #[serde(default = "default_experiments_secs")]
    pub experiments_secs: u64,

    /// Warm worker reconciliation interval.
    #[serde(default = "default_warm_workers_secs")]
    pub warm_workers_secs: u64,

    /// Also drives the orphan sweep.
    #[serde(default = "default_archive_gc_secs")]
    pub archive_gc_secs: u64,
}

const fn default_tick_interval_ms() -> u64 {
    1000
}

const fn default_eval_jobs_secs() -> u64 {
    10
}

const fn default_classify_secs() -> u64 {
    15
}

const fn default_experiments_secs() -> u64 {
    15
}

const fn default_warm_workers_secs() -> u64 {
    60
}

const fn default_archive_gc_secs() -> u64 {
    3600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            eval_jobs_secs: default_eval_jobs_secs(),
            classify_secs: default_classify_secs(),
            experiments_secs: default_experiments_secs(),
            warm_workers_secs: default_warm_workers_secs(),
            archive_gc_secs: default_archive_gc_secs(),
        }
    }
}

/// Orchestration policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OrchestratorConfig {
    /// Studies classified per sweep
    #[serde(default = "default_classification_batch_size")]
    pub classification_batch_size: usize,

    /// New evaluations created per experiment per sweep
    #[serde(default = "default_experiment_batch_size")]
    pub experiment_batch_size: usize,

    /// Age after which a non-terminal evaluation without output is reaped
    #[serde(default = "default_orphan_tolerance_secs")]
    pub orphan_tolerance_secs: u64,

    /// When set, retried failures count against a cycle's batch size
    #[serde(default = "default_true")]
    pub retries_share_batch_cap: bool,
}

const fn default_classification_batch_size() -> usize {
    5
}

const fn default_experiment_batch_size() -> usize {
    1
}

const fn default_orphan_tolerance_secs() -> u64 {
    3600
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            classification_batch_size: default_classification_batch_size(),
            experiment_batch_size: default_experiment_batch_size(),
            orphan_tolerance_secs: default_orphan_tolerance_secs(),
            retries_share_batch_cap: true,
        }
    }
}
