use std::path::Path;

use crate::config::schema::QueueConfig;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<QueueConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<QueueConfig, ConfigError> {
    let config: QueueConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

/// Upper bound for both retention windows, roughly a century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

pub const MAX_STALE_TIMEOUT_MINUTES: u64 = MAX_RETENTION_DAYS as u64 * 24 * 60;

pub fn validate_config(config: &QueueConfig) -> Result<(), ConfigError> {
    let fail = |message: String| Err(ConfigError::Validation { message });

    if !config.poll_interval_secs.is_finite() || config.poll_interval_secs <= 0.0 {
        return fail(format!(
            "poll_interval_secs must be positive, got {}",
            config.poll_interval_secs
        ));
    }

    if config.claim_max_retries == 0 {
        return fail("claim_max_retries must be at least 1".to_string());
    }

    if config.stale_timeout_minutes == 0 {
        return fail("stale_timeout_minutes must be at least 1".to_string());
    }

    if config.stale_timeout_minutes > MAX_STALE_TIMEOUT_MINUTES {
        return fail(format!(
            "stale_timeout_minutes must be at most {}, got {}",
            MAX_STALE_TIMEOUT_MINUTES, config.stale_timeout_minutes
        ));
    }

    if config.record_retention_days > MAX_RETENTION_DAYS {
        return fail(format!(
            "record_retention_days must be at most {}, got {}",
            MAX_RETENTION_DAYS, config.record_retention_days
        ));
    }

    if config.record_retention_days < config.file_retention_days {
        return fail(format!(
            "record_retention_days ({}) must not be shorter than file_retention_days ({})",
            config.record_retention_days, config.file_retention_days
        ));
    }

    if config.maintenance_interval_secs == 0 {
        return fail("maintenance_interval_secs must be at least 1".to_string());
    }

    if config.workers_per_device == 0 {
        return fail("workers_per_device must be at least 1".to_string());
    }

    if config.devices.is_empty() {
        return fail("At least one device is required".to_string());
    }

    let mut seen = std::collections::HashSet::new();
    for device in &config.devices {
        if device.trim().is_empty() {
            return fail("Device names must not be empty".to_string());
        }
        if !seen.insert(device) {
            return fail(format!("Duplicate device '{}'", device));
        }
    }

    Ok(())
}
