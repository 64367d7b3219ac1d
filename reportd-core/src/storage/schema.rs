//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use crate::error::StorageError;
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Hosts and their interactions
    r#"
    CREATE TABLE IF NOT EXISTS hosts (
        name              TEXT PRIMARY KEY,
        first_seen        DATETIME NOT NULL,
        last_seen         DATETIME NOT NULL,
        interaction_count INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS interactions (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        hostname         TEXT REFERENCES hosts(name),
        imported_at      DATETIME NOT NULL,

        -- Lossless capture
        payload          JSON NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_interactions_host ON interactions(hostname);
    CREATE INDEX IF NOT EXISTS idx_interactions_imported ON interactions(imported_at);
    "#,
    // Version 2: Content digest so a re-delivered interaction is stored once
    r#"
    ALTER TABLE interactions ADD COLUMN digest TEXT;

    CREATE UNIQUE INDEX IF NOT EXISTS idx_interactions_digest ON interactions(digest);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    if current_version > SCHEMA_VERSION {
        return Err(StorageError::Validation(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32, StorageError> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
