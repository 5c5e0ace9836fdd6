//! Schema versioning for the queue database.
//!
//! Applied versions are recorded in `_migrations`; each script in `sql/`
//! runs at most once, in version order.

use rusqlite::{Connection, TransactionBehavior};

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_tasks_table",
        sql: include_str!("sql/001_create_tasks.sql"),
    },
    Migration {
        version: 2,
        description: "create_claim_index",
        sql: include_str!("sql/002_create_claim_index.sql"),
    },
];

/// Brings the schema up to the latest version.
///
/// The whole run happens in one exclusive transaction, so several processes
/// opening the same fresh database cannot apply a migration twice.
pub fn run_all(conn: &mut Connection) -> Result<(), DatabaseError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current: u32 = tx.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        log::info!(
            "Applying schema v{}: {}",
            migration.version,
            migration.description
        );
        tx.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    tx.commit()?;
    Ok(())
}
