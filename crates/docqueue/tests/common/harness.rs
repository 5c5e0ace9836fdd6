//! Test harness for isolated queue tests.
//!
//! Every harness owns a temporary directory holding the SQLite file, input
//! files and the result root, so tests never share state.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use docqueue::db::task_repo::{self, ClaimPolicy};
use docqueue::db::Database;
use docqueue::engine::EngineRegistry;
use docqueue::task::{NewTask, Task};
use docqueue::worker::{Worker, WorkerSettings};

pub struct TestHarness {
    temp_dir: TempDir,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub db_path: PathBuf,
    /// Handle opened when the harness was created; migrations already ran.
    pub db: Database,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();

        let input_dir = base.join("input");
        let output_dir = base.join("output");
        std::fs::create_dir_all(&input_dir).expect("Failed to create input dir");
        std::fs::create_dir_all(&output_dir).expect("Failed to create output dir");

        let db_path = base.join("data").join("queue.db");
        let db = Database::open(&db_path).expect("Failed to open database");

        Self {
            temp_dir,
            input_dir,
            output_dir,
            db_path,
            db,
        }
    }

    /// Opens a second, independent connection to the same database file,
    /// the way another worker process would.
    pub fn open_handle(&self) -> Database {
        Database::open(&self.db_path).expect("Failed to open second handle")
    }

    pub fn base(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes an input file and returns its path.
    pub fn input_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.input_dir.join(name);
        std::fs::write(&path, content).expect("Failed to write input file");
        path
    }

    pub fn submit(&self, new_task: NewTask) -> String {
        task_repo::create_task(&self.db, &new_task).expect("Failed to create task")
    }

    /// Writes `name` into the input directory and submits it.
    pub fn submit_file(&self, name: &str, content: &str, backend: &str, priority: i64) -> String {
        let path = self.input_file(name, content);
        self.submit(
            NewTask::from_path(path.to_string_lossy())
                .backend(backend)
                .priority(priority),
        )
    }

    pub fn task(&self, task_id: &str) -> Task {
        task_repo::get_task(&self.db, task_id)
            .expect("Failed to read task")
            .expect("Task not found")
    }

    pub fn claim(&self, worker_id: &str) -> Option<Task> {
        task_repo::get_next_task(&self.db, worker_id, &ClaimPolicy::default())
            .expect("Claim failed")
    }

    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(10),
            output_dir: self.output_dir.clone(),
            ..WorkerSettings::default()
        }
    }

    pub fn worker(&self, id: &str, engines: EngineRegistry) -> Worker {
        Worker::with_id(id, self.db.clone(), engines, self.settings())
    }

    /// Renames a table, which makes every query against it fail until it is
    /// renamed back.
    pub fn rename_table(&self, from: &str, to: &str) {
        let sql = format!("ALTER TABLE {} RENAME TO {}", from, to);
        self.db
            .with_conn(|conn| Ok(conn.execute_batch(&sql)?))
            .expect("Failed to rename table");
    }

    /// Sets `completed_at` directly, to age a finished task.
    pub fn backdate_completion(&self, task_id: &str, at: chrono::DateTime<chrono::Utc>) {
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE tasks SET completed_at = ?2 WHERE task_id = ?1",
                    rusqlite::params![task_id, docqueue::task::format_timestamp(at)],
                )?;
                Ok(())
            })
            .expect("Failed to backdate task");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
