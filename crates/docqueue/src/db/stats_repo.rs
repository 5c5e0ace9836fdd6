//! Queue statistics: counts by status and pending-age diagnostics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use super::{Database, DatabaseError};
use crate::task::{parse_timestamp, TaskStatus};

/// Task counts per status. Statuses with no tasks count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    counts: BTreeMap<TaskStatus, u64>,
}

impl QueueStats {
    pub fn get(&self, status: TaskStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn pending(&self) -> u64 {
        self.get(TaskStatus::Pending)
    }

    pub fn processing(&self) -> u64 {
        self.get(TaskStatus::Processing)
    }
}

// Serialized as `{"pending": n, "processing": n, ...}` with every status present.
impl Serialize for QueueStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(TaskStatus::ALL.len()))?;
        for status in TaskStatus::ALL {
            map.serialize_entry(status.as_str(), &self.get(status))?;
        }
        map.end()
    }
}

/// Counts tasks grouped by status in one scan.
pub fn get_queue_stats(db: &Database) -> Result<QueueStats, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.parse::<TaskStatus>() {
                Ok(status) => {
                    stats.counts.insert(status, count.max(0) as u64);
                }
                Err(e) => log::warn!("Ignoring {} task(s) with {}", count, e),
            }
        }
        Ok(stats)
    })
}

/// Creation time of the oldest task still waiting to be claimed.
pub fn oldest_pending_created_at(db: &Database) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    let oldest: Option<String> = db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT MIN(created_at) FROM tasks WHERE status = 'pending'",
                [],
                |r| r.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    })?;

    oldest
        .map(|s| {
            parse_timestamp(&s).map_err(|e| DatabaseError::CorruptRow {
                task_id: "<oldest pending>".to_string(),
                reason: format!("invalid created_at: {}", e),
            })
        })
        .transpose()
}

/// How long the oldest pending task has been waiting, if any.
pub fn oldest_pending_age(db: &Database) -> Result<Option<chrono::Duration>, DatabaseError> {
    Ok(oldest_pending_created_at(db)?.map(|created| Utc::now() - created))
}
