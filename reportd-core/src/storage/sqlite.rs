//! SQLite storage backend
//!
//! Each interaction is stored losslessly as a JSON payload next to the host
//! it came from. Hosts keep first/last seen timestamps and a running count.

use super::schema;
use super::Storage;
use crate::error::StorageError;
use crate::types::Interaction;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::process;

/// An interaction as it was persisted.
#[derive(Debug, Clone)]
pub struct StoredInteraction {
    /// Row id
    pub id: i64,
    /// Reporting host, if the interaction named one
    pub hostname: Option<String>,
    /// When the collector stored it
    pub imported_at: DateTime<Utc>,
    /// The interaction itself
    pub interaction: Interaction,
}

/// Per-host import statistics.
#[derive(Debug, Clone)]
pub struct HostSummary {
    pub name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub interaction_count: i64,
}

/// SQLite-backed [`Storage`].
pub struct SqliteStorage {
    conn: Option<Connection>,
    /// Database file, `None` when in memory
    path: Option<PathBuf>,
    /// Process that opened `conn`
    owner_pid: u32,
}

impl SqliteStorage {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        Ok(Self {
            conn: Some(Self::connect(path)?),
            path: Some(path.to_path_buf()),
            owner_pid: process::id(),
        })
    }

    fn connect(path: &Path) -> Result<Connection, StorageError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Some(conn),
            path: None,
            owner_pid: process::id(),
        })
    }

    /// Replace the connection with a fresh one to the same file.
    ///
    /// In-memory and closed databases are left alone.
    fn reconnect(&mut self) -> Result<(), StorageError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if self.conn.is_none() {
            return Ok(());
        }

        let fresh = Self::connect(path)?;
        if let Some(inherited) = self.conn.replace(fresh) {
            // SQLite connections must not be closed in a forked child
            std::mem::forget(inherited);
        }
        self.owner_pid = process::id();
        tracing::debug!(path = %path.display(), "Reopened SQLite storage");
        Ok(())
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<(), StorageError> {
        schema::run_migrations(self.conn()?)
    }

    fn conn(&self) -> Result<&Connection, StorageError> {
        self.conn.as_ref().ok_or(StorageError::Closed)
    }

    fn conn_mut(&mut self) -> Result<&mut Connection, StorageError> {
        self.conn.as_mut().ok_or(StorageError::Closed)
    }

    // ============================================
    // Queries
    // ============================================

    /// Total number of stored interactions
    pub fn count_interactions(&self) -> Result<i64, StorageError> {
        let count = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM interactions", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Most recent interactions for a host, newest first
    pub fn interactions_for_host(
        &self,
        hostname: &str,
        limit: usize,
    ) -> Result<Vec<StoredInteraction>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, hostname, imported_at, payload
            FROM interactions
            WHERE hostname = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;

        let rows = stmt
            .query_map(params![hostname, limit as i64], Self::row_to_interaction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    /// All stored interactions in import order
    pub fn all_interactions(&self) -> Result<Vec<StoredInteraction>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, hostname, imported_at, payload FROM interactions ORDER BY id ASC",
        )?;

        let rows = stmt
            .query_map([], Self::row_to_interaction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    /// Look up a single host
    pub fn get_host(&self, name: &str) -> Result<Option<HostSummary>, StorageError> {
        let host = self
            .conn()?
            .query_row(
                "SELECT name, first_seen, last_seen, interaction_count FROM hosts WHERE name = ?1",
                [name],
                Self::row_to_host,
            )
            .optional()?;
        Ok(host)
    }

    /// All known hosts, most recently seen first
    pub fn hosts(&self) -> Result<Vec<HostSummary>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, first_seen, last_seen, interaction_count FROM hosts ORDER BY last_seen DESC",
        )?;

        let rows = stmt
            .query_map([], Self::row_to_host)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    fn row_to_interaction(row: &Row) -> rusqlite::Result<StoredInteraction> {
        let imported_at: String = row.get(2)?;
        let payload: String = row.get(3)?;

        let interaction: Interaction = serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(StoredInteraction {
            id: row.get(0)?,
            hostname: row.get(1)?,
            imported_at: parse_timestamp(&imported_at),
            interaction,
        })
    }

    fn row_to_host(row: &Row) -> rusqlite::Result<HostSummary> {
        let first_seen: String = row.get(1)?;
        let last_seen: String = row.get(2)?;

        Ok(HostSummary {
            name: row.get(0)?,
            first_seen: parse_timestamp(&first_seen),
            last_seen: parse_timestamp(&last_seen),
            interaction_count: row.get(3)?,
        })
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Storage for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    /// Applies pending migrations and runs `PRAGMA quick_check`.
    fn validate(&mut self) -> Result<(), StorageError> {
        self.migrate()?;

        let result: String = self
            .conn()?
            .query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if result != "ok" {
            return Err(StorageError::Validation(format!(
                "integrity check failed: {}",
                result
            )));
        }
        Ok(())
    }

    fn import_interaction(&mut self, interaction: &Interaction) -> Result<(), StorageError> {
        let payload = serde_json::to_string(interaction)?;
        let digest = interaction.digest();
        let hostname = interaction.hostname();
        let now = Utc::now().to_rfc3339();

        let tx = self.conn_mut()?.transaction()?;

        if let Some(host) = hostname {
            tx.execute(
                r#"
                INSERT INTO hosts (name, first_seen, last_seen, interaction_count)
                VALUES (?1, ?2, ?2, 0)
                ON CONFLICT(name) DO UPDATE SET last_seen = excluded.last_seen
                "#,
                params![host, now],
            )?;
        }

        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO interactions (hostname, imported_at, payload, digest)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![hostname, now, payload, digest],
        )?;

        if inserted == 0 {
            tracing::debug!(host = interaction.label(), %digest, "Interaction already stored");
        } else if let Some(host) = hostname {
            tx.execute(
                "UPDATE hosts SET interaction_count = interaction_count + 1 WHERE name = ?1",
                [host],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn after_fork(&mut self) -> Result<(), StorageError> {
        if self.owner_pid == process::id() {
            return Ok(());
        }
        self.reconnect()
    }

    fn shutdown(&mut self) -> Result<(), StorageError> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| StorageError::Database(e))?;
            tracing::debug!("Closed SQLite storage");
        }
        Ok(())
    }
}
