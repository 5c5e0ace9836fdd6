//! Document engines that turn a claimed task's input file into results.
//!
//! Workers never know what an engine does; they resolve one through the
//! [`EngineRegistry`] by the task's `backend` and hand it an [`EngineJob`].

pub mod text;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::EngineError;
use crate::task::{Task, AUTO_BACKEND};

pub use text::TextEngine;

/// Everything an engine gets to see about one task.
pub struct EngineJob<'a> {
    task: &'a Task,
    output_dir: PathBuf,
}

impl<'a> EngineJob<'a> {
    /// Builds a job writing under `<output_root>/<task_id>`.
    pub fn new(task: &'a Task, output_root: &Path) -> Self {
        Self {
            task,
            output_dir: output_root.join(&task.task_id),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    pub fn file_name(&self) -> &str {
        &self.task.file_name
    }

    pub fn input_path(&self) -> &Path {
        Path::new(&self.task.file_path)
    }

    /// Per-task output directory. Engines create it themselves.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn backend(&self) -> &str {
        &self.task.backend
    }

    pub fn options(&self) -> EngineOptions<'a> {
        EngineOptions(&self.task.options)
    }

    /// Best guess of the input's MIME type from its extension.
    pub fn mime_type(&self) -> String {
        mime_guess::from_path(self.input_path())
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }
}

/// The untyped per-task options map.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions<'a>(&'a Map<String, Value>);

impl EngineOptions<'_> {
    /// Deserializes the options into an engine's own option struct.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        serde_json::from_value(Value::Object(self.0.clone())).map_err(EngineError::InvalidOptions)
    }
}

/// What a successful engine run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    /// Location stored as the task's `result_path`.
    pub result_path: PathBuf,
    pub files: Vec<PathBuf>,
}

impl EngineOutput {
    pub fn new(result_path: impl Into<PathBuf>) -> Self {
        Self {
            result_path: result_path.into(),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.files.push(file.into());
        self
    }
}

pub trait Engine: Send + Sync {
    /// Backend name tasks use to select this engine.
    fn name(&self) -> &str;
    /// Whether this engine can handle the given input, used by `auto` routing.
    fn supports(&self, path: &Path) -> bool;
    fn process(&self, job: &EngineJob<'_>) -> Result<EngineOutput, EngineError>;
}

/// Routes tasks to engines by backend name.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: Vec<Arc<dyn Engine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in engines.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(TextEngine::new());
        registry
    }

    /// Adds an engine. A later engine with the same name replaces the earlier one.
    pub fn register(&mut self, engine: impl Engine + 'static) -> &mut Self {
        self.register_arc(Arc::new(engine))
    }

    pub fn register_arc(&mut self, engine: Arc<dyn Engine>) -> &mut Self {
        self.engines.retain(|e| e.name() != engine.name());
        self.engines.push(engine);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.engines.iter().map(|e| e.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Picks the engine for `backend`. `auto` takes the first registered
    /// engine that supports the input file.
    pub fn resolve(&self, backend: &str, input: &Path) -> Result<&dyn Engine, EngineError> {
        if backend == AUTO_BACKEND {
            return self
                .engines
                .iter()
                .find(|e| e.supports(input))
                .map(|e| e.as_ref())
                .ok_or_else(|| EngineError::UnsupportedFile(input.display().to_string()));
        }

        self.engines
            .iter()
            .find(|e| e.name() == backend)
            .map(|e| e.as_ref())
            .ok_or_else(|| EngineError::UnknownBackend(backend.to_string()))
    }

    pub fn process(&self, job: &EngineJob<'_>) -> Result<EngineOutput, EngineError> {
        let engine = self.resolve(job.backend(), job.input_path())?;
        log::debug!(
            "Task {} routed to engine '{}' ({})",
            job.task_id(),
            engine.name(),
            job.mime_type()
        );
        engine.process(job)
    }
}
