//! # reportd-core
//!
//! Core library for reportd - the reporting collector daemon.
//!
//! This library provides:
//! - The [`Interaction`] record reported by managed hosts
//! - Pluggable transports (spool directory, in-process) and storage backends
//!   (SQLite, JSON lines)
//! - The [`Collector`] loop that moves interactions from one to the other
//! - Pidfile locking and daemonization
//! - Configuration management and logging infrastructure
//!
//! ## Example
//!
//! ```rust,no_run
//! use reportd_core::{Collector, Config};
//!
//! let config = Config::load().expect("failed to load config");
//! let mut collector = Collector::from_config(&config).expect("failed to start collector");
//!
//! let handle = collector.handle();
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(60));
//!     handle.request_shutdown();
//! });
//!
//! collector.run().expect("collector failed to start");
//! ```

// Re-export commonly used items at the crate root
pub use collector::{Collector, CollectorHandle, CollectorSettings, CollectorStats};
pub use config::Config;
pub use error::{Error, ReportingError, Result, StorageError, TransportError};
pub use storage::Storage;
pub use transport::Transport;
pub use types::*;

// Public modules
pub mod collector;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod storage;
pub mod transport;
pub mod types;
