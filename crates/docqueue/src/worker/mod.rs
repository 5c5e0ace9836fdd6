//! Workers pull tasks from the store, run them through an engine and record
//! the outcome.

pub mod outcome;
pub mod pool;
pub mod shutdown;

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::config::QueueConfig;
use crate::db::stats_repo;
use crate::db::task_repo::{self, ClaimOutcome, ClaimPolicy};
use crate::db::{Database, DatabaseError};
use crate::engine::{EngineJob, EngineRegistry};
use crate::error::{EngineError, QueueError};
use crate::task::Task;

pub use outcome::PollOutcome;
pub use pool::WorkerPool;
pub use shutdown::ShutdownSignal;

/// Per-worker tunables.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub device: String,
    pub poll_interval: Duration,
    pub claim_policy: ClaimPolicy,
    /// Idle iterations between queue-stat log lines; 0 disables them.
    pub stats_log_every: u32,
    pub output_dir: PathBuf,
    /// When false, [`Worker::run`] returns at once and tasks are only
    /// processed through [`Worker::poll_once`].
    pub enable_worker_loop: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl WorkerSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            device: config
                .devices
                .first()
                .cloned()
                .unwrap_or_else(|| "cpu".to_string()),
            poll_interval: config.poll_interval(),
            claim_policy: config.claim_policy(),
            stats_log_every: config.stats_log_every,
            output_dir: config.output_directory.clone(),
            enable_worker_loop: config.enable_worker_loop,
        }
    }
}

/// Health snapshot of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub worker_id: String,
    pub device: String,
    pub running: bool,
    pub loop_enabled: bool,
    pub current_task: Option<String>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub engines: Vec<String>,
}

/// A single queue consumer.
///
/// Owns everything it needs; several workers can share one [`Database`]
/// handle or each open their own.
pub struct Worker {
    id: String,
    db: Database,
    engines: EngineRegistry,
    settings: WorkerSettings,
    running: AtomicBool,
    current_task: Mutex<Option<String>>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Worker {
    pub fn new(db: Database, engines: EngineRegistry, settings: WorkerSettings) -> Self {
        let id = worker_id(&settings.device, None);
        Self::with_id(id, db, engines, settings)
    }

    pub fn with_id(
        id: impl Into<String>,
        db: Database,
        engines: EngineRegistry,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id: id.into(),
            db,
            engines,
            settings,
            running: AtomicBool::new(false),
            current_task: Mutex::new(None),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Claims, processes and finalizes at most one task.
    pub fn poll_once(&self) -> Result<PollOutcome, QueueError> {
        let Some(task) = task_repo::get_next_task(&self.db, &self.id, &self.settings.claim_policy)?
        else {
            return Ok(PollOutcome::Idle);
        };

        let span = tracing::info_span!("task", task_id = %task.task_id, worker = %self.id);
        let _entered = span.enter();

        self.set_current_task(Some(&task.task_id));
        let started = Instant::now();
        let outcome = self.execute(&task);
        let finalized = self.finalize(&task, &outcome);
        self.set_current_task(None);

        if !finalized? {
            warn!(
                "Worker {} discarded result of task {}: claim was reclaimed or reset",
                self.id, task.task_id
            );
            return Ok(PollOutcome::Discarded {
                task_id: task.task_id,
            });
        }

        match outcome {
            ClaimOutcome::Completed { result_path } => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Worker {} completed task {} ({}) in {:.2?}",
                    self.id,
                    task.task_id,
                    task.file_name,
                    started.elapsed()
                );
                Ok(PollOutcome::Completed {
                    task_id: task.task_id,
                    result_path,
                })
            }
            ClaimOutcome::Failed { error_message } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Worker {} failed task {} ({}): {}",
                    self.id, task.task_id, task.file_name, error_message
                );
                Ok(PollOutcome::Failed {
                    task_id: task.task_id,
                    error: error_message,
                })
            }
        }
    }

    /// Records `outcome`, retrying store errors with the claim backoff.
    fn finalize(&self, task: &Task, outcome: &ClaimOutcome) -> Result<bool, DatabaseError> {
        let policy = &self.settings.claim_policy;
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match task_repo::finalize_claim(&self.db, task, outcome) {
                Err(e) if attempt < attempts => {
                    warn!(
                        "Worker {} could not record task {} ({}/{}): {}",
                        self.id, task.task_id, attempt, attempts, e
                    );
                    thread::sleep(policy.jittered_backoff());
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn execute(&self, task: &Task) -> ClaimOutcome {
        debug!(
            "Worker {} processing task {}: {} (backend={}, priority={}, retry={})",
            self.id, task.task_id, task.file_path, task.backend, task.priority, task.retry_count
        );

        let job = EngineJob::new(task, &self.settings.output_dir);
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.engines.process(&job)))
            .unwrap_or_else(|payload| Err(EngineError::Panicked(panic_message(&*payload))));

        match result {
            Ok(output) => ClaimOutcome::Completed {
                result_path: Some(output.result_path.to_string_lossy().into_owned()),
            },
            Err(e) => ClaimOutcome::Failed {
                error_message: e.task_message(),
            },
        }
    }

    /// Runs the poll loop until `shutdown` is triggered.
    ///
    /// Errors inside an iteration are logged and followed by a pause; they
    /// never end the loop.
    pub fn run(&self, shutdown: &ShutdownSignal) {
        if !self.settings.enable_worker_loop {
            info!(
                "Worker {} loop disabled, tasks are processed on manual poll only",
                self.id
            );
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        info!(
            "Worker {} started (device={}, poll_interval={:?}, engines={:?})",
            self.id,
            self.settings.device,
            self.settings.poll_interval,
            self.engines.names()
        );

        let mut idle_iterations: u64 = 0;
        while !shutdown.is_triggered() {
            match self.poll_once() {
                Ok(PollOutcome::Idle) => {
                    idle_iterations += 1;
                    let every = u64::from(self.settings.stats_log_every);
                    if every > 0 && idle_iterations % every == 0 {
                        self.log_idle_stats(idle_iterations);
                    }
                    if shutdown.wait_timeout(self.settings.poll_interval) {
                        break;
                    }
                }
                Ok(_) => idle_iterations = 0,
                Err(e) => {
                    error!("Worker {} loop error: {}", self.id, e);
                    if shutdown.wait_timeout(self.settings.poll_interval) {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(
            "Worker {} stopped (completed={}, failed={})",
            self.id,
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed)
        );
    }

    fn log_idle_stats(&self, idle_iterations: u64) {
        match stats_repo::get_queue_stats(&self.db) {
            Ok(stats) if stats.pending() > 0 => warn!(
                "Worker {} idle for {} polls while {} task(s) are pending (processing={})",
                self.id,
                idle_iterations,
                stats.pending(),
                stats.processing()
            ),
            Ok(stats) => info!(
                "Worker {} idle for {} polls (processing={}, completed={}, failed={})",
                self.id,
                idle_iterations,
                stats.processing(),
                stats.get(crate::task::TaskStatus::Completed),
                stats.get(crate::task::TaskStatus::Failed)
            ),
            Err(e) => debug!("Worker {} could not read queue stats: {}", self.id, e),
        }
    }

    pub fn health(&self) -> WorkerHealth {
        WorkerHealth {
            worker_id: self.id.clone(),
            device: self.settings.device.clone(),
            running: self.running.load(Ordering::SeqCst),
            loop_enabled: self.settings.enable_worker_loop,
            current_task: self.current_task(),
            tasks_completed: self.completed.load(Ordering::Relaxed),
            tasks_failed: self.failed.load(Ordering::Relaxed),
            engines: self.engines.names().into_iter().map(String::from).collect(),
        }
    }

    pub fn current_task(&self) -> Option<String> {
        match self.current_task.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_current_task(&self, task_id: Option<&str>) {
        let mut guard = match self.current_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = task_id.map(String::from);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Builds a worker id: `docqueue-{host}-{device}-{pid}`, with `-{index}`
/// appended when one process runs several workers.
pub fn worker_id(device: &str, index: Option<usize>) -> String {
    let base = format!(
        "docqueue-{}-{}-{}",
        hostname(),
        device.replace(':', "_"),
        std::process::id()
    );
    match index {
        Some(i) => format!("{}-{}", base, i),
        None => base,
    }
}

fn hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .chain(std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .find(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EngineOutput};
    use crate::task::{NewTask, TaskStatus};
    use std::path::Path;

    struct PanickingEngine;

    impl Engine for PanickingEngine {
        fn name(&self) -> &str {
            "panics"
        }

        fn supports(&self, _path: &Path) -> bool {
            false
        }

        fn process(&self, _job: &EngineJob<'_>) -> Result<EngineOutput, EngineError> {
            panic!("engine exploded");
        }
    }

    fn worker(db: &Database, output: &Path) -> Worker {
        let mut engines = EngineRegistry::with_defaults();
        engines.register(PanickingEngine);
        let settings = WorkerSettings {
            output_dir: output.to_path_buf(),
            poll_interval: Duration::from_millis(10),
            ..WorkerSettings::default()
        };
        Worker::with_id("test-worker", db.clone(), engines, settings)
    }

    #[test]
    fn test_poll_once_idle() {
        let db = Database::open_in_memory().unwrap();
        let out = tempfile::tempdir().unwrap();
        assert_eq!(worker(&db, out.path()).poll_once().unwrap(), PollOutcome::Idle);
    }

    #[test]
    fn test_poll_once_completes_text_task() {
        let db = Database::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("hello.txt");
        std::fs::write(&input, "hello").unwrap();
        let id = task_repo::create_task(
            &db,
            &NewTask::from_path(input.to_string_lossy()).backend("text"),
        )
        .unwrap();

        let w = worker(&db, &dir.path().join("out"));
        let expected = dir.path().join("out").join(&id);
        match w.poll_once().unwrap() {
            PollOutcome::Completed { task_id, result_path } => {
                assert_eq!(task_id, id);
                assert_eq!(result_path, Some(expected.to_string_lossy().into_owned()));
            }
            other => panic!("Expected completion, got {:?}", other),
        }
        assert!(expected.join("hello.md").exists());

        let task = task_repo::get_task(&db, &id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(w.health().tasks_completed, 1);
        assert!(w.health().current_task.is_none());
    }

    #[test]
    fn test_unknown_backend_fails_task() {
        let db = Database::open_in_memory().unwrap();
        let out = tempfile::tempdir().unwrap();
        let id = task_repo::create_task(&db, &NewTask::new("a.pdf", "/in/a.pdf").backend("vlm"))
            .unwrap();

        match worker(&db, out.path()).poll_once().unwrap() {
            PollOutcome::Failed { task_id, error } => {
                assert_eq!(task_id, id);
                assert!(error.starts_with("UnknownBackend: "));
            }
            other => panic!("Expected failure, got {:?}", other),
        }
        let task = task_repo::get_task(&db, &id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("vlm"));
    }

    #[test]
    fn test_engine_panic_fails_task() {
        let db = Database::open_in_memory().unwrap();
        let out = tempfile::tempdir().unwrap();
        let id = task_repo::create_task(&db, &NewTask::new("a.bin", "/in/a.bin").backend("panics"))
            .unwrap();

        let w = worker(&db, out.path());
        assert!(matches!(w.poll_once().unwrap(), PollOutcome::Failed { .. }));

        let task = task_repo::get_task(&db, &id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error_message.as_deref(),
            Some("EnginePanic: Engine panicked: engine exploded")
        );
        assert_eq!(w.health().tasks_failed, 1);
    }

    #[test]
    fn test_run_disabled_loop_returns() {
        let db = Database::open_in_memory().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut w = worker(&db, out.path());
        w.settings.enable_worker_loop = false;
        task_repo::create_task(&db, &NewTask::new("a", "/a")).unwrap();

        w.run(&ShutdownSignal::new());
        assert!(!w.health().running);
        assert_eq!(
            stats_repo::get_queue_stats(&db).unwrap().pending(),
            1,
            "a disabled loop must not claim"
        );
    }

    #[test]
    fn test_finalize_retries_through_brief_outage() {
        let db = Database::open_in_memory().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut w = worker(&db, out.path());
        w.settings.claim_policy = ClaimPolicy {
            max_attempts: 6,
            backoff: Duration::from_millis(40),
        };
        task_repo::create_task(&db, &NewTask::new("a", "/a")).unwrap();
        let task = task_repo::get_next_task(&db, w.id(), &ClaimPolicy::default())
            .unwrap()
            .unwrap();

        let rename = |from: &str, to: &str| {
            let sql = format!("ALTER TABLE {} RENAME TO {}", from, to);
            db.with_conn(|conn| Ok(conn.execute_batch(&sql)?)).unwrap();
        };
        rename("tasks", "tasks_offline");

        let outcome = ClaimOutcome::Completed { result_path: None };
        let finalized = thread::scope(|s| {
            let attempt = s.spawn(|| w.finalize(&task, &outcome));
            thread::sleep(Duration::from_millis(30));
            rename("tasks_offline", "tasks");
            attempt.join().unwrap()
        });

        assert!(finalized.unwrap());
        let stored = task_repo::get_task(&db, &task.task_id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[test]
    fn test_worker_id_format() {
        let id = worker_id("cuda:0", None);
        assert!(id.starts_with("docqueue-"));
        assert!(id.contains("-cuda_0-"));
        assert!(id.ends_with(&std::process::id().to_string()));
        assert!(worker_id("cpu", Some(2)).ends_with("-2"));
    }
}
