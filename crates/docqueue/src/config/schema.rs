use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::task_repo::ClaimPolicy;
use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// SQLite file. Falls back to `~/.docqueue/data/docqueue.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
    #[serde(default = "default_stale_timeout_minutes")]
    pub stale_timeout_minutes: u64,
    #[serde(default = "default_claim_max_retries")]
    pub claim_max_retries: u32,
    #[serde(default = "default_claim_backoff_ms")]
    pub claim_backoff_ms: u64,
    #[serde(default = "default_file_retention_days")]
    pub file_retention_days: u32,
    #[serde(default = "default_record_retention_days")]
    pub record_retention_days: u32,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    #[serde(default = "default_true")]
    pub cleanup_enabled: bool,
    /// Idle iterations between queue-stat log lines; 0 turns them off.
    #[serde(default = "default_stats_log_every")]
    pub stats_log_every: u32,
    #[serde(default = "default_workers_per_device")]
    pub workers_per_device: usize,
    #[serde(default = "default_devices")]
    pub devices: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_worker_loop: bool,
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("./output")
}

fn default_poll_interval_secs() -> f64 {
    0.5
}

fn default_stale_timeout_minutes() -> u64 {
    60
}

fn default_claim_max_retries() -> u32 {
    3
}

fn default_claim_backoff_ms() -> u64 {
    100
}

fn default_file_retention_days() -> u32 {
    7
}

fn default_record_retention_days() -> u32 {
    30
}

fn default_maintenance_interval_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_stats_log_every() -> u32 {
    20
}

fn default_workers_per_device() -> usize {
    1
}

fn default_devices() -> Vec<String> {
    vec!["cpu".to_string()]
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            output_directory: default_output_directory(),
            poll_interval_secs: default_poll_interval_secs(),
            stale_timeout_minutes: default_stale_timeout_minutes(),
            claim_max_retries: default_claim_max_retries(),
            claim_backoff_ms: default_claim_backoff_ms(),
            file_retention_days: default_file_retention_days(),
            record_retention_days: default_record_retention_days(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            cleanup_enabled: true,
            stats_log_every: default_stats_log_every(),
            workers_per_device: default_workers_per_device(),
            devices: default_devices(),
            enable_worker_loop: true,
        }
    }
}

impl QueueConfig {
    pub fn resolved_database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => crate::db::default_database_path().ok_or(ConfigError::NoDatabasePath),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs.max(0.0))
    }

    /// Saturates at the largest representable span, which never expires a claim.
    pub fn stale_timeout(&self) -> chrono::Duration {
        i64::try_from(self.stale_timeout_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            max_attempts: self.claim_max_retries,
            backoff: Duration::from_millis(self.claim_backoff_ms),
        }
    }
}
