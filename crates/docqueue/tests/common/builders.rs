//! Builders for test configurations and engines.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docqueue::config::QueueConfig;
use docqueue::engine::{Engine, EngineJob, EngineOutput};
use docqueue::error::EngineError;

/// Builder for `QueueConfig` instances.
pub struct ConfigBuilder {
    config: QueueConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: QueueConfig::default(),
        }
    }

    pub fn database_path(mut self, path: &Path) -> Self {
        self.config.database_path = Some(path.to_path_buf());
        self
    }

    pub fn output_directory(mut self, path: &Path) -> Self {
        self.config.output_directory = path.to_path_buf();
        self
    }

    pub fn poll_interval_secs(mut self, secs: f64) -> Self {
        self.config.poll_interval_secs = secs;
        self
    }

    pub fn retention(mut self, file_days: u32, record_days: u32) -> Self {
        self.config.file_retention_days = file_days;
        self.config.record_retention_days = record_days;
        self
    }

    pub fn devices(mut self, devices: &[&str]) -> Self {
        self.config.devices = devices.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn workers_per_device(mut self, n: usize) -> Self {
        self.config.workers_per_device = n;
        self
    }

    pub fn build(self) -> QueueConfig {
        self.config
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.config).expect("Failed to serialize config")
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What the scripted engine does for one input file name.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    Fail(String),
    SleepThenSucceed(Duration),
    Panic,
}

/// Engine whose behaviour is scripted per input file name. Unscripted
/// files succeed. Every call is recorded.
#[derive(Clone)]
pub struct ScriptedEngine {
    name: String,
    scripts: HashMap<String, Script>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedEngine {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scripts: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn on(mut self, file_name: &str, script: Script) -> Self {
        self.scripts.insert(file_name.to_string(), script);
        self
    }

    /// Shared view of the recorded calls (task ids, in call order).
    pub fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }
}

impl Engine for ScriptedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, _path: &Path) -> bool {
        true
    }

    fn process(&self, job: &EngineJob<'_>) -> Result<EngineOutput, EngineError> {
        self.calls.lock().unwrap().push(job.task_id().to_string());

        match self.scripts.get(job.file_name()).cloned().unwrap_or(Script::Succeed) {
            Script::Succeed => write_result(job),
            Script::Fail(message) => Err(EngineError::Failed(message)),
            Script::SleepThenSucceed(pause) => {
                std::thread::sleep(pause);
                write_result(job)
            }
            Script::Panic => panic!("scripted panic for {}", job.file_name()),
        }
    }
}

fn write_result(job: &EngineJob<'_>) -> Result<EngineOutput, EngineError> {
    let dir = job.output_dir().to_path_buf();
    std::fs::create_dir_all(&dir).map_err(|e| EngineError::WriteOutput {
        path: dir.clone(),
        source: e,
    })?;
    let file: PathBuf = dir.join("result.md");
    std::fs::write(&file, format!("processed {}", job.file_name())).map_err(|e| {
        EngineError::WriteOutput {
            path: file.clone(),
            source: e,
        }
    })?;
    Ok(EngineOutput::new(dir).with_file(file))
}
