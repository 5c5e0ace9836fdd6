//! Periodic stale-task reclaim and retention sweeps.

use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::config::QueueConfig;
use crate::db::task_repo;
use crate::db::Database;
use crate::worker::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    pub interval: Duration,
    pub stale_timeout: chrono::Duration,
    pub cleanup_enabled: bool,
    pub file_retention_days: u32,
    pub record_retention_days: u32,
}

impl MaintenanceSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            interval: config.maintenance_interval(),
            stale_timeout: config.stale_timeout(),
            cleanup_enabled: config.cleanup_enabled,
            file_retention_days: config.file_retention_days,
            record_retention_days: config.record_retention_days,
        }
    }
}

/// What one maintenance pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub reclaimed: usize,
    pub files_removed: usize,
    pub records_deleted: usize,
}

/// Runs one pass: reclaim, then the file sweep, then the record sweep.
///
/// Each step's failure is logged and the remaining steps still run.
pub fn run_maintenance(db: &Database, settings: &MaintenanceSettings) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();

    match task_repo::reset_stale_tasks(db, settings.stale_timeout) {
        Ok(n) => report.reclaimed = n,
        Err(e) => log::error!("Stale task reclaim failed: {}", e),
    }

    if settings.cleanup_enabled {
        match task_repo::cleanup_old_task_files(db, settings.file_retention_days) {
            Ok(n) => report.files_removed = n,
            Err(e) => log::error!("Result file cleanup failed: {}", e),
        }
        match task_repo::cleanup_old_task_records(db, settings.record_retention_days) {
            Ok(n) => report.records_deleted = n,
            Err(e) => log::error!("Task record cleanup failed: {}", e),
        }
    }

    if report != MaintenanceReport::default() {
        log::info!(
            "Maintenance: reclaimed={}, files_removed={}, records_deleted={}",
            report.reclaimed,
            report.files_removed,
            report.records_deleted
        );
    }
    report
}

/// Runs [`run_maintenance`] on a background thread every `interval`.
pub struct MaintenanceScheduler {
    db: Database,
    settings: MaintenanceSettings,
    shutdown: ShutdownSignal,
}

impl MaintenanceScheduler {
    pub fn new(db: Database, settings: MaintenanceSettings, shutdown: ShutdownSignal) -> Self {
        Self {
            db,
            settings,
            shutdown,
        }
    }

    /// Starts the loop. The first pass runs immediately so tasks stranded by
    /// a previous crash are requeued at startup.
    pub fn start(&self) -> std::io::Result<JoinHandle<()>> {
        let db = self.db.clone();
        let settings = self.settings.clone();
        let shutdown = self.shutdown.clone();

        std::thread::Builder::new()
            .name("docqueue-maintenance".to_string())
            .spawn(move || {
                log::info!(
                    "Maintenance scheduler started (interval={:?}, stale_timeout={}m)",
                    settings.interval,
                    settings.stale_timeout.num_minutes()
                );
                loop {
                    run_maintenance(&db, &settings);
                    if shutdown.wait_timeout(settings.interval) {
                        break;
                    }
                }
                log::info!("Maintenance scheduler stopped");
            })
    }

    /// Signals the scheduler to stop. This shares the signal given to `new`.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }
}
