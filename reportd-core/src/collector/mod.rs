//! The collector: pulls interactions from a transport into a storage backend
//!
//! ```text
//! CONSTRUCTED ──run()──► (daemon context) ──► MONITORING + LOOPING ──► TERMINATED
//! ```
//!
//! Construction loads both backends, rejects in-process transports and
//! validates storage. [`Collector::run`] then blocks, importing one
//! interaction at a time in fetch order, until the termination flag is set
//! through [`CollectorHandle::request_shutdown`] or [`Collector::shutdown`].
//! Termination is final: a collector cannot be restarted.

mod dead_letter;
mod handle;

pub use dead_letter::DeadLetterSink;
pub use handle::CollectorHandle;

use crate::config::Config;
use crate::error::{ReportingError, StorageError, TransportError};
use crate::lifecycle::{DaemonContext, DaemonSettings};
use crate::storage::{self, Storage};
use crate::transport::{self, Transport};
use crate::types::Interaction;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;

/// Collector behavior that is not part of the backends themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorSettings {
    /// Lock a pidfile (and possibly detach) when `run` starts
    pub daemon: Option<DaemonSettings>,
    /// Refuse to start when storage validation fails
    pub strict_validation: bool,
    /// Keep interactions whose import failed here instead of dropping them
    pub dead_letter_dir: Option<PathBuf>,
}

impl CollectorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            daemon: DaemonSettings::from_config(&config.daemon),
            strict_validation: config.reporting.strict_validation,
            dead_letter_dir: config.reporting.dead_letter_dir.clone(),
        }
    }
}

/// Counters for one collector run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    /// Interactions returned by the transport
    pub fetched: u64,
    /// Interactions the storage accepted
    pub imported: u64,
    /// Interactions the storage rejected
    pub failed: u64,
    /// Rejected interactions preserved in the dead-letter directory
    pub dead_lettered: u64,
}

/// How the main loop reacts to a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopFault {
    /// The transport is gone; stop the collector.
    Shutdown,
    /// Anything else; log it and keep going.
    Failed,
}

/// Failure of one fetch/import cycle.
#[derive(Error, Debug)]
enum CycleError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] TransportError),

    #[error("import failed: {0}")]
    Import(#[from] StorageError),
}

impl CycleError {
    fn fault(&self) -> LoopFault {
        match self {
            CycleError::Fetch(TransportError::Closed) => LoopFault::Shutdown,
            _ => LoopFault::Failed,
        }
    }
}

/// Owns one transport and one storage backend and moves interactions
/// between them.
pub struct Collector {
    transport: Option<Box<dyn Transport>>,
    storage: Option<Box<dyn Storage>>,
    handle: CollectorHandle,
    settings: CollectorSettings,
    context: Option<DaemonContext>,
    dead_letter: Option<DeadLetterSink>,
    stats: CollectorStats,
}

impl Collector {
    /// Build the configured transport and storage and prepare a collector.
    ///
    /// Logging should already be initialized; construction failures are
    /// logged here before being returned.
    pub fn from_config(config: &Config) -> Result<Self, ReportingError> {
        let transport_kind = config.reporting.transport.as_str();
        let storage_kind = config.reporting.storage.as_str();

        let mut transport = transport::from_config(config).map_err(|e| {
            tracing::error!(transport = transport_kind, error = %e, "Failed to load transport");
            ReportingError::Transport(e)
        })?;

        let storage = match storage::from_config(config) {
            Ok(storage) => storage,
            Err(e) => {
                tracing::error!(storage = storage_kind, error = %e, "Failed to load storage");
                if let Err(e) = transport.shutdown() {
                    tracing::debug!(error = %e, "Transport shutdown failed");
                }
                return Err(ReportingError::Storage(e));
            }
        };

        Self::with_backends(transport, storage, CollectorSettings::from_config(config))
    }

    /// Prepare a collector around already-built backends.
    ///
    /// Rejects direct transports and validates the storage backend. A
    /// validation failure is logged and ignored unless
    /// [`CollectorSettings::strict_validation`] is set.
    pub fn with_backends(
        transport: Box<dyn Transport>,
        storage: Box<dyn Storage>,
        settings: CollectorSettings,
    ) -> Result<Self, ReportingError> {
        let direct = transport.is_direct().then(|| transport.name().to_string());

        let mut collector = Self {
            transport: Some(transport),
            storage: Some(storage),
            handle: CollectorHandle::new(),
            dead_letter: settings.dead_letter_dir.as_deref().map(DeadLetterSink::new),
            settings,
            context: None,
            stats: CollectorStats::default(),
        };

        if let Some(name) = direct {
            tracing::error!(
                transport = %name,
                "Transport writes to storage in-process and cannot feed a collector, \
                 use the storage directly instead"
            );
            collector.release();
            return Err(ReportingError::IncompatibleTransport { transport: name });
        }

        let failed_validation = collector
            .storage
            .as_mut()
            .and_then(|storage| storage.validate().err().map(|e| (storage.name(), e)));

        if let Some((name, e)) = failed_validation {
            tracing::error!(storage = name, error = %e, "Storage backend failed to validate");
            if collector.settings.strict_validation {
                collector.release();
                return Err(ReportingError::Validation {
                    storage: name.to_string(),
                    source: e,
                });
            }
        }

        Ok(collector)
    }

    /// Handle for stopping this collector from other threads.
    pub fn handle(&self) -> CollectorHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> CollectorStats {
        self.stats
    }

    pub fn is_terminated(&self) -> bool {
        self.handle.is_terminated()
    }

    /// Run until shut down.
    ///
    /// Fails only if the collector cannot start: the pidfile is locked, the
    /// process cannot detach or reopen its storage, or the transport monitor
    /// does not start. In that case the backends are released and the loop is
    /// never entered.
    /// Once looping, errors are logged and `Ok` is returned after shutdown.
    pub fn run(&mut self) -> Result<(), ReportingError> {
        if self.is_terminated() {
            tracing::debug!("Collector already shut down, not starting");
            return Ok(());
        }

        self.daemonize()?;

        if let Some(transport) = self.transport.as_mut() {
            let name = transport.name();
            if let Err(e) = transport.start_monitor(self.handle.clone()) {
                tracing::error!(transport = name, error = %e, "Failed to start transport monitor");
                self.release();
                return Err(ReportingError::Monitor(e));
            }
        }

        tracing::info!(
            transport = self.transport.as_ref().map(|t| t.name()),
            storage = self.storage.as_ref().map(|s| s.name()),
            "Collector started"
        );

        while !self.is_terminated() {
            if let Err(e) = self.cycle() {
                match e.fault() {
                    LoopFault::Shutdown => {
                        tracing::info!(reason = %e, "Shutting down");
                        self.release();
                    }
                    LoopFault::Failed => {
                        tracing::error!(error = %e, "Unhandled error in main loop");
                    }
                }
            }
        }

        self.release();
        tracing::info!(
            fetched = self.stats.fetched,
            imported = self.stats.imported,
            failed = self.stats.failed,
            dead_lettered = self.stats.dead_lettered,
            "Collector stopped"
        );
        Ok(())
    }

    /// Take the pidfile lock and detach, if daemon mode is configured.
    ///
    /// `run` does this itself. Call it first when something must be set up
    /// in the detached process before the loop starts, such as signal
    /// handling threads, which do not survive `fork`. Does nothing once the
    /// daemon context is held or the collector has been shut down. Once the
    /// context is held the storage reopens anything that cannot cross `fork`.
    /// On failure the collector is shut down.
    pub fn daemonize(&mut self) -> Result<(), ReportingError> {
        if self.context.is_some() || self.is_terminated() {
            return Ok(());
        }
        let Some(settings) = self.settings.daemon.clone() else {
            return Ok(());
        };

        let context = match DaemonContext::open(&settings) {
            Ok(context) => context,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start daemon");
                self.release();
                return Err(e);
            }
        };
        tracing::info!(
            pidfile = %settings.pidfile.display(),
            detached = context.is_detached(),
            pid = std::process::id(),
            "Running as daemon"
        );
        self.context = Some(context);

        if let Some(storage) = self.storage.as_mut() {
            if let Err(e) = storage.after_fork() {
                tracing::error!(storage = storage.name(), error = %e, "Failed to reopen storage");
                self.release();
                return Err(ReportingError::Reopen(e));
            }
        }
        Ok(())
    }

    /// Fetch at most one interaction and import it.
    fn cycle(&mut self) -> Result<(), CycleError> {
        let transport = self.transport.as_mut().ok_or(TransportError::Closed)?;
        let Some(interaction) = transport.fetch()? else {
            return Ok(());
        };
        self.stats.fetched += 1;

        let storage = self.storage.as_mut().ok_or(StorageError::Closed)?;
        let started = Instant::now();
        match storage.import_interaction(&interaction) {
            Ok(()) => {
                self.stats.imported += 1;
                tracing::info!(
                    host = interaction.label(),
                    elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
                    "Imported interaction"
                );
                Ok(())
            }
            Err(e) => {
                self.stats.failed += 1;
                self.keep_failed(&interaction, &e);
                Err(e.into())
            }
        }
    }

    fn keep_failed(&mut self, interaction: &Interaction, error: &StorageError) {
        let Some(sink) = &self.dead_letter else {
            return;
        };

        match sink.keep(interaction, &error.to_string()) {
            Ok(path) => {
                self.stats.dead_lettered += 1;
                tracing::warn!(
                    host = interaction.label(),
                    path = %path.display(),
                    "Kept failed interaction"
                );
            }
            Err(e) => tracing::error!(
                host = interaction.label(),
                dir = %sink.dir().display(),
                error = %e,
                "Failed to keep failed interaction"
            ),
        }
    }

    /// Stop the collector and release the transport, the storage and the
    /// pidfile.
    ///
    /// Safe to call before `run`, after it, and any number of times; each
    /// resource is released once. Transport release errors are logged.
    /// A storage release error is returned.
    pub fn shutdown(&mut self) -> Result<(), ReportingError> {
        self.handle.request_shutdown();

        if let Some(mut transport) = self.transport.take() {
            match transport.shutdown() {
                Ok(()) => {}
                Err(TransportError::Io(e)) => {
                    tracing::debug!(transport = transport.name(), error = %e, "Transport release failed");
                }
                Err(e) => {
                    tracing::error!(transport = transport.name(), error = %e, "Transport shutdown failed");
                }
            }
        }

        let result = match self.storage.take() {
            Some(mut storage) => storage.shutdown().map_err(ReportingError::Shutdown),
            None => Ok(()),
        };

        if let Some(context) = self.context.take() {
            tracing::debug!(pidfile = %context.pidfile().path().display(), "Releasing pid file");
        }

        result
    }

    /// Shutdown for paths that have nowhere to report a storage error
    fn release(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "Collector shutdown failed");
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageKind, TransportKind};
    use crate::storage::SqliteStorage;
    use crate::transport::LocalFilesystem;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.spool.path = dir.path().join("spool");
        config.spool.poll_interval_ms = 20;
        config.sqlite.path = dir.path().join("reports.db");
        config.json_lines.path = dir.path().join("interactions.jsonl");
        config
    }

    #[test]
    fn test_settings_from_config() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        assert_eq!(CollectorSettings::from_config(&config), CollectorSettings::default());

        config.daemon.enabled = true;
        config.daemon.pidfile = dir.path().join("c.pid");
        config.reporting.strict_validation = true;
        config.reporting.dead_letter_dir = Some(dir.path().join("dead"));

        let settings = CollectorSettings::from_config(&config);
        assert!(settings.strict_validation);
        assert_eq!(settings.dead_letter_dir, Some(dir.path().join("dead")));
        assert_eq!(
            settings.daemon.map(|d| d.pidfile),
            Some(dir.path().join("c.pid"))
        );
    }

    #[test]
    fn test_fault_classification() {
        assert_eq!(
            CycleError::Fetch(TransportError::Closed).fault(),
            LoopFault::Shutdown
        );
        assert_eq!(
            CycleError::Fetch(TransportError::Config("x".into())).fault(),
            LoopFault::Failed
        );
        assert_eq!(
            CycleError::Import(StorageError::Closed).fault(),
            LoopFault::Failed
        );
    }

    #[test]
    fn test_from_config_builds_and_validates() {
        let dir = TempDir::new().unwrap();
        let mut collector = Collector::from_config(&config(&dir)).unwrap();
        assert!(!collector.is_terminated());

        collector.shutdown().unwrap();
        assert!(collector.is_terminated());
        // Validation migrated the database
        let storage = SqliteStorage::open(&dir.path().join("reports.db")).unwrap();
        assert_eq!(storage.count_interactions().unwrap(), 0);
    }

    #[test]
    fn test_from_config_rejects_direct_store() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.reporting.transport = TransportKind::DirectStore;

        let err = Collector::from_config(&config).err().unwrap();
        assert!(matches!(
            err,
            ReportingError::IncompatibleTransport { ref transport } if transport == "direct_store"
        ));

        // Neither storage was migrated
        let conn = rusqlite::Connection::open(&config.sqlite.path).unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 0);
    }

    #[test]
    fn test_from_config_storage_failure_is_reporting_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();

        let mut config = config(&dir);
        config.sqlite.path = blocker.join("reports.db");

        let err = Collector::from_config(&config).err().unwrap();
        assert!(matches!(err, ReportingError::Storage(_)));
    }

    #[test]
    fn test_run_after_shutdown_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.reporting.storage = StorageKind::JsonLines;

        let mut collector = Collector::from_config(&config).unwrap();
        collector.handle().request_shutdown();
        collector.run().unwrap();
        assert_eq!(collector.stats(), CollectorStats::default());
    }

    #[test]
    fn test_daemonize_holds_pidfile_once() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.daemon.enabled = true;
        config.daemon.foreground = true;
        config.daemon.pidfile = dir.path().join("collector.pid");

        let mut collector = Collector::from_config(&config).unwrap();
        collector.daemonize().unwrap();
        collector.daemonize().unwrap();
        assert!(config.daemon.pidfile.exists());

        collector.shutdown().unwrap();
        assert!(!config.daemon.pidfile.exists());
        collector.daemonize().unwrap();
        assert!(!config.daemon.pidfile.exists());
    }

    #[test]
    fn test_run_imports_spooled_interactions() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let producer = LocalFilesystem::new(&config.spool.path, Duration::from_millis(20)).unwrap();
        producer
            .spool_interaction(&Interaction::new().with_hostname("web01"))
            .unwrap();

        let mut collector = Collector::from_config(&config).unwrap();
        let handle = collector.handle();
        let stopper = std::thread::spawn(move || {
            let db = SqliteStorage::open(&dir.path().join("reports.db")).unwrap();
            for _ in 0..500 {
                if db.count_interactions().unwrap() == 1 {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            handle.request_shutdown();
            dir
        });

        collector.run().unwrap();
        let dir = stopper.join().unwrap();

        assert_eq!(collector.stats().imported, 1);
        let db = SqliteStorage::open(&dir.path().join("reports.db")).unwrap();
        assert_eq!(db.get_host("web01").unwrap().unwrap().interaction_count, 1);
    }
}
