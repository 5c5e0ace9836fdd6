//! Task repository: CRUD, claiming, finalization and sweeps over the
//! `tasks` table.
//!
//! Every state change is a conditional UPDATE whose WHERE clause re-checks
//! the expected prior state, so callers learn from the affected-row count
//! whether they still own the row.

use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::{Map, Value};

use super::{Database, DatabaseError};
use crate::error::QueueError;
use crate::task::{format_timestamp, parse_timestamp, NewTask, Task, TaskStatus};

const TASK_COLUMNS: &str = "task_id, file_name, file_path, status, priority, backend, options,
     result_path, error_message, created_at, started_at, completed_at, worker_id,
     retry_count, producer_id";

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

/// A raw task row from the database.
#[derive(Debug, Clone)]
struct TaskRow {
    task_id: String,
    file_name: String,
    file_path: String,
    status: String,
    priority: i64,
    backend: String,
    options: String,
    result_path: Option<String>,
    error_message: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    worker_id: Option<String>,
    retry_count: i64,
    producer_id: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            task_id: row.get("task_id")?,
            file_name: row.get("file_name")?,
            file_path: row.get("file_path")?,
            status: row.get("status")?,
            priority: row.get("priority")?,
            backend: row.get("backend")?,
            options: row.get("options")?,
            result_path: row.get("result_path")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            worker_id: row.get("worker_id")?,
            retry_count: row.get("retry_count")?,
            producer_id: row.get("producer_id")?,
        })
    }

    fn into_task(self) -> Result<Task, DatabaseError> {
        let corrupt = |reason: String| DatabaseError::CorruptRow {
            task_id: self.task_id.clone(),
            reason,
        };
        let timestamp = |value: &str, field: &str| {
            parse_timestamp(value).map_err(|e| corrupt(format!("invalid {}: {}", field, e)))
        };

        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        let options = match serde_json::from_str::<Value>(&self.options) {
            Ok(Value::Object(map)) => map,
            Ok(Value::Null) => Map::new(),
            Ok(other) => return Err(corrupt(format!("options is not an object: {}", other))),
            Err(e) => return Err(corrupt(format!("invalid options JSON: {}", e))),
        };
        let created_at = timestamp(&self.created_at, "created_at")?;
        let started_at = self
            .started_at
            .as_deref()
            .map(|s| timestamp(s, "started_at"))
            .transpose()?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(|s| timestamp(s, "completed_at"))
            .transpose()?;

        Ok(Task {
            task_id: self.task_id,
            file_name: self.file_name,
            file_path: self.file_path,
            status,
            priority: self.priority,
            backend: self.backend,
            options,
            result_path: self.result_path,
            error_message: self.error_message,
            created_at,
            started_at,
            completed_at,
            worker_id: self.worker_id,
            retry_count: self.retry_count,
            producer_id: self.producer_id,
        })
    }
}

fn query_tasks(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Task>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, TaskRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

fn find_in(conn: &Connection, task_id: &str) -> Result<Option<Task>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE task_id = ?1", TASK_COLUMNS),
            params![task_id],
            TaskRow::from_row,
        )
        .optional()?;
    row.map(TaskRow::into_task).transpose()
}

/// Inserts a new pending task and returns its generated id.
pub fn create_task(db: &Database, new_task: &NewTask) -> Result<String, DatabaseError> {
    create_task_at(db, new_task, Utc::now())
}

/// Like [`create_task`] with an explicit creation time.
pub fn create_task_at(
    db: &Database,
    new_task: &NewTask,
    created_at: DateTime<Utc>,
) -> Result<String, DatabaseError> {
    let task_id = uuid::Uuid::new_v4().to_string();
    let options = Value::Object(new_task.options.clone()).to_string();

    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO tasks (task_id, file_name, file_path, status, priority, backend,
             options, created_at, retry_count, producer_id)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, 0, ?8)",
            params![
                task_id,
                new_task.file_name,
                new_task.file_path,
                new_task.priority,
                new_task.backend,
                options,
                format_timestamp(created_at),
                new_task.producer_id,
            ],
        )?;
        Ok(())
    })?;

    log::debug!(
        "Created task {} ({}, backend={}, priority={})",
        task_id,
        new_task.file_name,
        new_task.backend,
        new_task.priority
    );
    Ok(task_id)
}

/// Finds a task by its id.
pub fn get_task(db: &Database, task_id: &str) -> Result<Option<Task>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, task_id))
}

/// Lists tasks with the given status, newest first.
pub fn get_tasks_by_status(
    db: &Database,
    status: TaskStatus,
    limit: u32,
) -> Result<Vec<Task>, DatabaseError> {
    db.with_conn(|conn| {
        query_tasks(
            conn,
            &format!(
                "SELECT {} FROM tasks WHERE status = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                TASK_COLUMNS
            ),
            params![status.as_str(), limit],
        )
    })
}

/// Lists tasks submitted by one producer, newest first.
pub fn get_tasks_by_producer(
    db: &Database,
    producer_id: &str,
    limit: u32,
) -> Result<Vec<Task>, DatabaseError> {
    db.with_conn(|conn| {
        query_tasks(
            conn,
            &format!(
                "SELECT {} FROM tasks WHERE producer_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                TASK_COLUMNS
            ),
            params![producer_id, limit],
        )
    })
}

/// Retry bounds for [`get_next_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    /// Attempts per call, covering both lost races and store errors.
    pub max_attempts: u32,
    /// Upper bound of the pause after a store error.
    pub backoff: Duration,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl ClaimPolicy {
    /// Picks a pause in `[backoff / 2, backoff]` so contending workers spread out.
    pub(crate) fn jittered_backoff(&self) -> Duration {
        let max = self.backoff.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(max / 2..=max);
        Duration::from_millis(millis)
    }
}

enum ClaimAttempt {
    Claimed(Task),
    Empty,
    LostRace(String),
}

/// Claims the best pending task for `worker_id`.
///
/// Service order is `priority DESC, created_at ASC`. The returned task is
/// already `processing` and bound to the worker. Lost races are retried up
/// to `policy.max_attempts` times and then reported as `None`; a store error
/// that persists through every attempt is returned.
pub fn get_next_task(
    db: &Database,
    worker_id: &str,
    policy: &ClaimPolicy,
) -> Result<Option<Task>, DatabaseError> {
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..=attempts {
        match try_claim(db, worker_id) {
            Ok(ClaimAttempt::Claimed(task)) => {
                log::debug!("{} claimed task {} (attempt {})", worker_id, task.task_id, attempt);
                return Ok(Some(task));
            }
            Ok(ClaimAttempt::Empty) => return Ok(None),
            Ok(ClaimAttempt::LostRace(task_id)) => {
                log::debug!(
                    "Task {} was taken by another worker, retrying ({}/{})",
                    task_id,
                    attempt,
                    attempts
                );
            }
            Err(e) if attempt < attempts => {
                log::warn!(
                    "Claim attempt {}/{} for {} failed: {}",
                    attempt,
                    attempts,
                    worker_id,
                    e
                );
                thread::sleep(policy.jittered_backoff());
            }
            Err(e) => return Err(e),
        }
    }

    log::warn!("{} failed to claim a task after {} attempts", worker_id, attempts);
    Ok(None)
}

fn try_claim(db: &Database, worker_id: &str) -> Result<ClaimAttempt, DatabaseError> {
    db.with_conn_mut(|conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT task_id FROM tasks WHERE status = 'pending'
                 ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;

        let Some(task_id) = candidate else {
            tx.commit()?;
            return Ok(ClaimAttempt::Empty);
        };

        let changed = tx.execute(
            "UPDATE tasks SET status = 'processing', started_at = ?1, worker_id = ?2
             WHERE task_id = ?3 AND status = 'pending'",
            params![format_timestamp(Utc::now()), worker_id, task_id],
        )?;
        if changed != 1 {
            // Dropping the transaction rolls it back.
            return Ok(ClaimAttempt::LostRace(task_id));
        }

        let task = find_in(&tx, &task_id)?.ok_or_else(|| DatabaseError::CorruptRow {
            task_id: task_id.clone(),
            reason: "row vanished inside the claim transaction".to_string(),
        })?;
        tx.commit()?;
        Ok(ClaimAttempt::Claimed(task))
    })
}

/// Ownership checks applied to a finalizing write.
///
/// `worker_id` pins the write to the claiming worker. `retry_count` pins it
/// to one specific claim: a stale reclaim increments the counter, so a
/// straggler holding an older claim cannot finalize a newer one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fence<'a> {
    pub worker_id: Option<&'a str>,
    pub retry_count: Option<i64>,
}

impl<'a> Fence<'a> {
    /// No ownership check beyond `status = 'processing'`.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn worker(worker_id: &'a str) -> Self {
        Self {
            worker_id: Some(worker_id),
            retry_count: None,
        }
    }

    /// Fences on the exact claim that produced `task`.
    pub fn claim(task: &'a Task) -> Self {
        Self {
            worker_id: task.worker_id.as_deref(),
            retry_count: Some(task.retry_count),
        }
    }
}

/// Marks a processing task completed. Returns false when the fence or the
/// `processing` precondition no longer holds.
pub fn complete_task(
    db: &Database,
    task_id: &str,
    result_path: Option<&str>,
    fence: Fence<'_>,
) -> Result<bool, DatabaseError> {
    finish(db, task_id, TaskStatus::Completed, result_path, None, fence)
}

/// Marks a processing task failed. Returns false when the fence or the
/// `processing` precondition no longer holds.
pub fn fail_task(
    db: &Database,
    task_id: &str,
    error_message: &str,
    fence: Fence<'_>,
) -> Result<bool, DatabaseError> {
    finish(db, task_id, TaskStatus::Failed, None, Some(error_message), fence)
}

fn finish(
    db: &Database,
    task_id: &str,
    status: TaskStatus,
    result_path: Option<&str>,
    error_message: Option<&str>,
    fence: Fence<'_>,
) -> Result<bool, DatabaseError> {
    let changed = db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE tasks
             SET status = ?2, result_path = ?3, error_message = ?4,
                 completed_at = ?5, worker_id = NULL
             WHERE task_id = ?1 AND status = 'processing'
               AND (?6 IS NULL OR worker_id = ?6)
               AND (?7 IS NULL OR retry_count = ?7)",
            params![
                task_id,
                status.as_str(),
                result_path,
                error_message,
                format_timestamp(Utc::now()),
                fence.worker_id,
                fence.retry_count,
            ],
        )?)
    })?;

    if changed == 0 {
        log::debug!(
            "Status update to {} did not apply: task_id={}, worker_id={:?}, retry_count={:?}",
            status,
            task_id,
            fence.worker_id,
            fence.retry_count
        );
    }
    Ok(changed > 0)
}

/// Cancels a task that has not been claimed yet.
pub fn cancel_task(db: &Database, task_id: &str) -> Result<bool, DatabaseError> {
    let changed = db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE tasks SET status = 'cancelled', completed_at = ?2
             WHERE task_id = ?1 AND status = 'pending'",
            params![task_id, format_timestamp(Utc::now())],
        )?)
    })?;
    Ok(changed > 0)
}

/// Administrative reset back to `pending`, whatever the current status.
///
/// Clears the worker binding and every completion field. `started_at` and
/// `retry_count` are kept as history.
pub fn reset_task(db: &Database, task_id: &str) -> Result<bool, DatabaseError> {
    let changed = db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE tasks
             SET status = 'pending', worker_id = NULL, completed_at = NULL,
                 result_path = NULL, error_message = NULL
             WHERE task_id = ?1",
            params![task_id],
        )?)
    })?;
    Ok(changed > 0)
}

/// Result of running a claimed task, applied by [`finalize_claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Completed { result_path: Option<String> },
    Failed { error_message: String },
}

/// Finalizes the claim that produced `task`, fenced on both the worker id
/// and the retry count observed at claim time.
pub fn finalize_claim(
    db: &Database,
    task: &Task,
    outcome: &ClaimOutcome,
) -> Result<bool, DatabaseError> {
    match outcome {
        ClaimOutcome::Completed { result_path } => {
            complete_task(db, &task.task_id, result_path.as_deref(), Fence::claim(task))
        }
        ClaimOutcome::Failed { error_message } => {
            fail_task(db, &task.task_id, error_message, Fence::claim(task))
        }
    }
}

/// Moves a task to `status`.
///
/// - `Completed` / `Failed` apply only to a `processing` task, and only to
///   the one held by `worker_id` when given.
/// - `Cancelled` applies only to a `pending` task.
/// - `Pending` is an administrative reset from any status.
/// - `Processing` is refused; claiming is the only way in.
///
/// `Ok(false)` means the precondition did not match any row.
pub fn update_task_status(
    db: &Database,
    task_id: &str,
    status: TaskStatus,
    result_path: Option<&str>,
    error_message: Option<&str>,
    worker_id: Option<&str>,
) -> Result<bool, QueueError> {
    let fence = Fence {
        worker_id,
        retry_count: None,
    };
    let applied = match status {
        TaskStatus::Completed => complete_task(db, task_id, result_path, fence)?,
        TaskStatus::Failed => {
            fail_task(db, task_id, error_message.unwrap_or("unknown error"), fence)?
        }
        TaskStatus::Cancelled => cancel_task(db, task_id)?,
        TaskStatus::Pending => reset_task(db, task_id)?,
        TaskStatus::Processing => return Err(QueueError::InvalidTransition(status)),
    };
    Ok(applied)
}

/// Requeues `processing` tasks whose claim is older than `timeout`.
pub fn reset_stale_tasks(db: &Database, timeout: chrono::Duration) -> Result<usize, DatabaseError> {
    reset_stale_tasks_at(db, timeout, Utc::now())
}

/// Like [`reset_stale_tasks`] with an explicit current time.
pub fn reset_stale_tasks_at(
    db: &Database,
    timeout: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    if timeout < chrono::Duration::zero() {
        log::warn!("Ignoring negative stale timeout {}", timeout);
        return Ok(0);
    }
    let Some(cutoff) = now.checked_sub_signed(timeout) else {
        return Ok(0);
    };
    let cutoff = format_timestamp(cutoff);
    let reset = db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE tasks
             SET status = 'pending', worker_id = NULL, retry_count = retry_count + 1
             WHERE status = 'processing' AND started_at < ?1",
            params![cutoff],
        )?)
    })?;

    if reset > 0 {
        log::warn!("Requeued {} stale task(s) claimed before {}", reset, cutoff);
    }
    Ok(reset)
}

/// Deletes result artifacts of terminal tasks finished more than `days`
/// ago and clears their `result_path`. Returns how many artifacts were
/// actually removed from disk.
///
/// An artifact that is already gone only gets its path cleared. An
/// artifact that cannot be removed keeps its path so the next sweep
/// retries it.
pub fn cleanup_old_task_files(db: &Database, days: u32) -> Result<usize, DatabaseError> {
    cleanup_old_task_files_at(db, days, Utc::now())
}

/// Like [`cleanup_old_task_files`] with an explicit current time.
pub fn cleanup_old_task_files_at(
    db: &Database,
    days: u32,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let Some(cutoff) = retention_cutoff(now, days) else {
        return Ok(0);
    };
    let cutoff = format_timestamp(cutoff);
    let candidates: Vec<(String, String)> = db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT task_id, result_path FROM tasks
             WHERE status IN {} AND completed_at < ?1 AND result_path IS NOT NULL",
            TERMINAL_STATUSES
        ))?;
        let rows = stmt
            .query_map(params![cutoff], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    let mut removed = 0;
    for (task_id, result_path) in candidates {
        if sweep_artifact(db, &task_id, &result_path, &cutoff)? {
            removed += 1;
        }
    }

    if removed > 0 {
        log::info!("Removed {} result artifact(s) older than {} days", removed, days);
    }
    Ok(removed)
}

/// Removes one candidate artifact and clears its `result_path`.
///
/// The row is re-checked first: a task that was reset or re-completed
/// since the candidates were selected may own a fresh artifact at the same
/// path. Returns true when something was removed from disk.
fn sweep_artifact(
    db: &Database,
    task_id: &str,
    result_path: &str,
    cutoff: &str,
) -> Result<bool, DatabaseError> {
    if !db.with_conn(|conn| artifact_expired(conn, task_id, result_path, cutoff))? {
        log::debug!("Task {} changed since selection, keeping {}", task_id, result_path);
        return Ok(false);
    }

    let removed = match remove_artifact(Path::new(result_path)) {
        Ok(removed) => removed,
        Err(e) => {
            log::warn!("Failed to delete result files for task {}: {}", task_id, e);
            return Ok(false);
        }
    };
    if !removed {
        log::debug!("Result for task {} already gone: {}", task_id, result_path);
    }

    db.with_conn(|conn| {
        conn.execute(
            &format!(
                "UPDATE tasks SET result_path = NULL
                 WHERE task_id = ?1 AND result_path = ?2
                   AND status IN {} AND completed_at < ?3",
                TERMINAL_STATUSES
            ),
            params![task_id, result_path, cutoff],
        )?;
        Ok(())
    })?;
    Ok(removed)
}

fn artifact_expired(
    conn: &Connection,
    task_id: &str,
    result_path: &str,
    cutoff: &str,
) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM tasks
             WHERE task_id = ?1 AND result_path = ?2
               AND status IN {} AND completed_at < ?3",
            TERMINAL_STATUSES
        ),
        params![task_id, result_path, cutoff],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// `now - days`, or `None` when that lies outside the representable range,
/// in which case nothing is old enough.
fn retention_cutoff(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    chrono::Duration::try_days(i64::from(days)).and_then(|age| now.checked_sub_signed(age))
}

/// Removes a file or directory tree. `Ok(false)` means it did not exist.
fn remove_artifact(path: &Path) -> io::Result<bool> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Permanently deletes terminal task rows finished more than `days` ago.
pub fn cleanup_old_task_records(db: &Database, days: u32) -> Result<usize, DatabaseError> {
    cleanup_old_task_records_at(db, days, Utc::now())
}

/// Like [`cleanup_old_task_records`] with an explicit current time.
pub fn cleanup_old_task_records_at(
    db: &Database,
    days: u32,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let Some(cutoff) = retention_cutoff(now, days) else {
        return Ok(0);
    };
    let cutoff = format_timestamp(cutoff);
    let deleted = db.with_conn(|conn| {
        Ok(conn.execute(
            &format!(
                "DELETE FROM tasks WHERE status IN {} AND completed_at < ?1",
                TERMINAL_STATUSES
            ),
            params![cutoff],
        )?)
    })?;

    if deleted > 0 {
        log::info!("Deleted {} task record(s) older than {} days", deleted, days);
    }
    Ok(deleted)
}
