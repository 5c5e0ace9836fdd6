use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};

use docqueue::config::{load_config, validate_config, QueueConfig};
use docqueue::db::{stats_repo, task_repo, Database};
use docqueue::engine::EngineRegistry;
use docqueue::error::{QueueError, WorkerError};
use docqueue::logging::init_logging;
use docqueue::maintenance::{MaintenanceScheduler, MaintenanceSettings};
use docqueue::task::{NewTask, TaskStatus};
use docqueue::worker::{ShutdownSignal, Worker, WorkerPool, WorkerSettings};

#[derive(Parser, Debug)]
#[command(
    name = "docqueue",
    version,
    about = "Persistent SQLite task queue for document conversion workers"
)]
struct Cli {
    /// JSON config file.
    #[arg(long, global = true, env = "DOCQUEUE_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file.
    #[arg(long, global = true, env = "DATABASE_PATH")]
    database: Option<PathBuf>,

    /// Root directory for task results.
    #[arg(long, global = true, env = "OUTPUT_PATH")]
    output_dir: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run workers until interrupted.
    Worker {
        /// Devices to start workers for, comma separated.
        #[arg(long, value_delimiter = ',')]
        devices: Option<Vec<String>>,
        #[arg(long)]
        workers_per_device: Option<usize>,
        /// Seconds to sleep when the queue is empty.
        #[arg(long)]
        poll_interval: Option<f64>,
        /// Only run maintenance; tasks are then processed with `docqueue poll`.
        #[arg(long)]
        disable_worker_loop: bool,
    },
    /// Submit a file for processing.
    Submit {
        file: PathBuf,
        #[arg(long, default_value = "auto")]
        backend: String,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i64,
        /// Engine options as a JSON object.
        #[arg(long)]
        options: Option<String>,
        #[arg(long)]
        producer: Option<String>,
    },
    /// Show one task.
    Status { task_id: String },
    /// Show task counts per status.
    Stats,
    /// List tasks with a given status, newest first.
    List {
        #[arg(long)]
        status: TaskStatus,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Cancel a pending task.
    Cancel { task_id: String },
    /// Put a task back into the queue.
    Reset { task_id: String },
    /// Requeue tasks stuck in processing.
    Reclaim {
        #[arg(long)]
        timeout_minutes: Option<u64>,
    },
    /// Delete old result files and task records.
    Cleanup {
        #[arg(long)]
        files_days: Option<u32>,
        #[arg(long)]
        records_days: Option<u32>,
    },
    /// Claim and process a single task in this process.
    Poll,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.json_logs) {
        eprintln!("{}", e);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), QueueError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => QueueConfig::default(),
    };
    if let Some(database) = cli.database {
        config.database_path = Some(database);
    }
    if let Some(output_dir) = cli.output_dir {
        config.output_directory = output_dir;
    }

    let db = Database::open(&config.resolved_database_path()?)?;

    match cli.command {
        Command::Worker {
            devices,
            workers_per_device,
            poll_interval,
            disable_worker_loop,
        } => {
            if let Some(devices) = devices {
                config.devices = devices;
            }
            if let Some(n) = workers_per_device {
                config.workers_per_device = n;
            }
            if let Some(secs) = poll_interval {
                config.poll_interval_secs = secs;
            }
            if disable_worker_loop {
                config.enable_worker_loop = false;
            }
            run_workers(db, &config)
        }
        Command::Submit {
            file,
            backend,
            priority,
            options,
            producer,
        } => {
            let path = std::fs::canonicalize(&file).map_err(|e| QueueError::InputFile {
                path: file.clone(),
                source: e,
            })?;
            let mut new_task = NewTask::from_path(path.to_string_lossy())
                .backend(backend)
                .priority(priority);
            if let Some(raw) = options {
                match serde_json::from_str::<Value>(&raw)? {
                    Value::Object(map) => new_task = new_task.options(map),
                    other => {
                        return Err(QueueError::InvalidInput(format!(
                            "--options must be a JSON object, got {}",
                            other
                        )))
                    }
                }
            }
            if let Some(producer) = producer {
                new_task = new_task.producer(producer);
            }
            let task_id = task_repo::create_task(&db, &new_task)?;
            print_json(&json!({ "task_id": task_id, "status": TaskStatus::Pending }))
        }
        Command::Status { task_id } => {
            let task =
                task_repo::get_task(&db, &task_id)?.ok_or(QueueError::TaskNotFound(task_id))?;
            print_json(&task)
        }
        Command::Stats => {
            let stats = stats_repo::get_queue_stats(&db)?;
            let oldest = stats_repo::oldest_pending_age(&db)?;
            print_json(&json!({
                "stats": stats,
                "total": stats.total(),
                "oldest_pending_seconds": oldest.map(|age| age.num_seconds()),
            }))
        }
        Command::List { status, limit } => {
            print_json(&task_repo::get_tasks_by_status(&db, status, limit)?)
        }
        Command::Cancel { task_id } => {
            let cancelled = task_repo::cancel_task(&db, &task_id)?;
            let task =
                task_repo::get_task(&db, &task_id)?.ok_or(QueueError::TaskNotFound(task_id))?;
            print_json(&json!({
                "task_id": task.task_id,
                "cancelled": cancelled,
                "status": task.status,
            }))
        }
        Command::Reset { task_id } => {
            if !task_repo::reset_task(&db, &task_id)? {
                return Err(QueueError::TaskNotFound(task_id));
            }
            print_json(&json!({ "task_id": task_id, "status": TaskStatus::Pending }))
        }
        Command::Reclaim { timeout_minutes } => {
            let timeout = match timeout_minutes {
                Some(minutes) => stale_timeout(minutes)?,
                None => config.stale_timeout(),
            };
            let reclaimed = task_repo::reset_stale_tasks(&db, timeout)?;
            print_json(&json!({ "reclaimed": reclaimed }))
        }
        Command::Cleanup {
            files_days,
            records_days,
        } => {
            let files_removed = task_repo::cleanup_old_task_files(
                &db,
                files_days.unwrap_or(config.file_retention_days),
            )?;
            let records_deleted = task_repo::cleanup_old_task_records(
                &db,
                records_days.unwrap_or(config.record_retention_days),
            )?;
            print_json(&json!({
                "files_removed": files_removed,
                "records_deleted": records_deleted,
            }))
        }
        Command::Poll => {
            let worker = Worker::new(
                db,
                EngineRegistry::with_defaults(),
                WorkerSettings::from_config(&config),
            );
            print_json(&worker.poll_once()?)
        }
    }
}

fn run_workers(db: Database, config: &QueueConfig) -> Result<(), QueueError> {
    validate_config(config)?;

    let shutdown = ShutdownSignal::new();
    let handler_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("Shutdown requested");
        handler_signal.trigger();
    })
    .map_err(|e| WorkerError::SignalHandler(e.to_string()))?;

    let maintenance = MaintenanceScheduler::new(
        db.clone(),
        MaintenanceSettings::from_config(config),
        shutdown.clone(),
    )
    .start()
    .map_err(|e| WorkerError::SpawnFailed(format!("maintenance scheduler: {}", e)))?;

    let engines = EngineRegistry::with_defaults();
    log::info!("Available engines: {:?}", engines.names());

    let result = if config.enable_worker_loop {
        let pool = WorkerPool::start(
            &db,
            &engines,
            &WorkerSettings::from_config(config),
            &config.devices,
            config.workers_per_device,
            shutdown.clone(),
        )?;
        for health in pool.health() {
            log::info!("Worker ready: {}", serde_json::to_string(&health)?);
        }
        pool.wait().map_err(QueueError::from)
    } else {
        log::info!("Worker loop disabled; process tasks with `docqueue poll`");
        while !shutdown.wait_timeout(Duration::from_secs(60)) {}
        Ok(())
    };

    if maintenance.join().is_err() {
        log::error!("Maintenance scheduler panicked");
    }
    result
}

fn stale_timeout(minutes: u64) -> Result<chrono::Duration, QueueError> {
    i64::try_from(minutes)
        .ok()
        .and_then(chrono::Duration::try_minutes)
        .ok_or_else(|| {
            QueueError::InvalidInput(format!("--timeout-minutes {} is out of range", minutes))
        })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), QueueError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
