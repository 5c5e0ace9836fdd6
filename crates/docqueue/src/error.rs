use std::path::PathBuf;
use thiserror::Error;

use crate::task::TaskStatus;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Tasks cannot be moved to '{0}' directly")]
    InvalidTransition(TaskStatus),

    #[error("Input file '{path}' is not accessible: {source}")]
    InputFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("No database path configured and no home directory found")]
    NoDatabasePath,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No engine registered for backend '{0}'")]
    UnknownBackend(String),

    #[error("No engine supports '{0}'")]
    UnsupportedFile(String),

    #[error("Invalid engine options: {0}")]
    InvalidOptions(#[source] serde_json::Error),

    #[error("Failed to read input '{path}': {source}")]
    ReadInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write output '{path}': {source}")]
    WriteOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Failed(String),

    #[error("Engine panicked: {0}")]
    Panicked(String),
}

impl EngineError {
    /// Short kind name used as the prefix of a task's stored error message.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UnknownBackend(_) => "UnknownBackend",
            EngineError::UnsupportedFile(_) => "UnsupportedFile",
            EngineError::InvalidOptions(_) => "InvalidOptions",
            EngineError::ReadInput { .. } => "ReadInput",
            EngineError::WriteOutput { .. } => "WriteOutput",
            EngineError::Failed(_) => "EngineFailed",
            EngineError::Panicked(_) => "EnginePanic",
        }
    }

    /// Error text persisted on a failed task: `"{kind}: {message}"`.
    pub fn task_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker thread '{0}' panicked")]
    Panicked(String),

    #[error("Failed to install signal handler: {0}")]
    SignalHandler(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
