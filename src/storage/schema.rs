// src/storage/schema.rs
//! Database schema and forward migrations
//!
//! A `schema_version` table records the applied version. Creation and
//! migration are idempotent, so every open runs [`migrate`].

use crate::utils::errors::{EngineError, Result};
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

/// Current schema version
pub const SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA: &str = r#"
CREATE TABLE schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE runs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    duration_ms INTEGER,
    agent_type TEXT,
    user_id TEXT,
    session_id TEXT,
    metadata TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE steps (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    type TEXT NOT NULL,
    name TEXT,
    status TEXT,
    duration_ms INTEGER,
    data BLOB NOT NULL,
    parent_event_id TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
);

CREATE INDEX idx_runs_started_at ON runs(started_at);
CREATE INDEX idx_runs_status ON runs(status);
CREATE INDEX idx_runs_user_id ON runs(user_id);
CREATE INDEX idx_runs_session_id ON runs(session_id);
CREATE INDEX idx_steps_run_id ON steps(run_id);
CREATE INDEX idx_steps_timestamp ON steps(timestamp);
CREATE INDEX idx_steps_type ON steps(type);
CREATE INDEX idx_steps_run_id_timestamp ON steps(run_id, timestamp);
"#;

/// Create the schema if missing, then apply pending migrations
pub fn migrate(conn: &Connection) -> Result<()> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    if exists.is_none() {
        info!("Creating database schema (version {})", SCHEMA_VERSION);
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(CREATE_SCHEMA)
            .map_err(|e| EngineError::StorageFailed(format!("Schema creation failed: {}", e)))?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )?;
        tx.commit()?;
        return Ok(());
    }

    let current = current_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(EngineError::StorageFailed(format!(
            "Database schema version {} is newer than supported version {}",
            current, SCHEMA_VERSION
        )));
    }

    if current < SCHEMA_VERSION {
        info!(
            "Migrating database schema from version {} to {}",
            current, SCHEMA_VERSION
        );
        let tx = conn.unchecked_transaction()?;
        // Version-specific steps go here, in order
        tx.execute("DELETE FROM schema_version", [])?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )?;
        tx.commit()?;
    }

    Ok(())
}

/// Highest applied schema version (0 when none is recorded)
pub fn current_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_schema() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('runs', 'steps')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_old_version_is_upgraded() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute("UPDATE schema_version SET version = 0", []).unwrap();

        migrate(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute("UPDATE schema_version SET version = 99", []).unwrap();

        assert!(migrate(&conn).is_err());
    }
}
