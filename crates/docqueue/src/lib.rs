pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod task;
pub mod worker;

pub use config::{load_config, load_config_from_str, QueueConfig};
pub use db::stats_repo::QueueStats;
pub use db::task_repo::{ClaimOutcome, ClaimPolicy, Fence};
pub use db::{Database, DatabaseError};
pub use engine::{Engine, EngineJob, EngineOutput, EngineRegistry};
pub use error::{ConfigError, EngineError, QueueError, Result, WorkerError};
pub use maintenance::{MaintenanceReport, MaintenanceScheduler, MaintenanceSettings};
pub use task::{NewTask, Task, TaskStatus};
pub use worker::{PollOutcome, ShutdownSignal, Worker, WorkerHealth, WorkerPool, WorkerSettings};
