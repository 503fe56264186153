//! Database migrations
//!
//! `CREATE ... IF NOT EXISTS` cannot alter a table that already exists, so the
//! schema version is tracked in `PRAGMA user_version` and each migration runs
//! exactly once, in order, inside its own transaction.

use rusqlite::Connection;

use crate::error::{FerretError, Result};

const MIGRATIONS: [&str; 4] = [
    include_str!("../../migrations/001_initial_schema.sql"),
    include_str!("../../migrations/002_add_fts.sql"),
    include_str!("../../migrations/003_add_search_history.sql"),
    include_str!("../../migrations/004_add_history_query_embedding.sql"),
];

pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

/// Current on-disk schema version.
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .map_err(|err| FerretError::TransactionFailed(err.to_string()))
}

/// Run all pending migrations on the database
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    let current = current_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(FerretError::TransactionFailed(format!(
            "database schema version {current} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let target_version = (idx + 1) as u32;
        if current >= target_version {
            continue;
        }

        tracing::debug!(target_version, "applying migration");
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql).map_err(|err| {
            FerretError::TransactionFailed(format!("migration {target_version} failed: {err}"))
        })?;
        tx.pragma_update(None, "user_version", target_version)
            .map_err(|err| {
                FerretError::TransactionFailed(format!(
                    "failed to set user_version {target_version}: {err}"
                ))
            })?;
        tx.commit()?;
    }

    Ok(SCHEMA_VERSION)
}
