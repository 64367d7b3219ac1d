//! Storage backends for reported interactions
//!
//! A backend persists one [`Interaction`] at a time. The collector validates
//! it once at startup and releases it on shutdown:
//!
//! ```text
//! validate() ──► [after_fork()] ──► import_interaction() ... ──► shutdown()
//! ```
//!
//! Backends are selected by `[reporting] storage` in the config file.

mod json_lines;
pub mod schema;
mod sqlite;

pub use json_lines::JsonLinesStorage;
pub use sqlite::{HostSummary, SqliteStorage, StoredInteraction};

use crate::config::{Config, StorageKind};
use crate::error::StorageError;
use crate::types::Interaction;

/// Durable sink for interactions.
pub trait Storage: Send {
    /// Backend name for log lines
    fn name(&self) -> &'static str;

    /// Check the backend is usable as configured.
    fn validate(&mut self) -> Result<(), StorageError>;

    /// Called once the daemon context is held, in the process that will run
    /// the loop. Backends whose handles cannot cross `fork` reopen them here.
    fn after_fork(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Persist a single interaction.
    fn import_interaction(&mut self, interaction: &Interaction) -> Result<(), StorageError>;

    /// Release backend resources. Calling it again is a no-op.
    fn shutdown(&mut self) -> Result<(), StorageError>;
}

/// Build the storage backend selected in the configuration.
pub fn from_config(config: &Config) -> Result<Box<dyn Storage>, StorageError> {
    let storage: Box<dyn Storage> = match config.reporting.storage {
        StorageKind::Sqlite => Box::new(SqliteStorage::open(&config.sqlite.path)?),
        StorageKind::JsonLines => Box::new(JsonLinesStorage::new(&config.json_lines.path)),
    };

    tracing::debug!(storage = storage.name(), "Loaded storage backend");
    Ok(storage)
}
