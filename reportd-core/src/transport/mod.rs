//! Transports deliver interactions to the collector
//!
//! ```text
//! ┌──────────────┐  store()  ┌─────────────────┐  fetch()  ┌───────────┐
//! │  reporters   │ ────────► │    Transport    │ ────────► │ Collector │
//! └──────────────┘           │ ├─ LocalFilesystem          └───────────┘
//!                            │ └─ DirectStore (in-process, not collectable)
//!                            └─────────────────┘
//! ```
//!
//! A transport may run its own background monitor (started with
//! [`Transport::start_monitor`]) to notice new work; the collector only ever
//! pulls from it with [`Transport::fetch`], one interaction at a time.

mod direct;
mod local;

pub use direct::DirectStore;
pub use local::LocalFilesystem;

use crate::collector::CollectorHandle;
use crate::config::{Config, TransportKind};
use crate::error::TransportError;
use crate::storage;
use crate::types::Interaction;

/// Source of interactions.
pub trait Transport: Send {
    /// Transport name for log lines
    fn name(&self) -> &'static str;

    /// True for transports that write to storage in-process instead of
    /// handing interactions to a collector.
    fn is_direct(&self) -> bool {
        false
    }

    /// Begin background production of interactions. Must not block.
    ///
    /// The handle lets the monitor stop the collector if it fails fatally.
    fn start_monitor(&mut self, collector: CollectorHandle) -> Result<(), TransportError>;

    /// Next interaction, or `None` if nothing arrived within the transport's
    /// poll interval. Blocks for at most that interval.
    fn fetch(&mut self) -> Result<Option<Interaction>, TransportError>;

    /// Hand an interaction to the transport (the reporting side).
    fn store(&mut self, interaction: Interaction) -> Result<(), TransportError>;

    /// Release transport resources. Calling it again is a no-op.
    fn shutdown(&mut self) -> Result<(), TransportError>;
}

/// Build the transport selected in the configuration.
pub fn from_config(config: &Config) -> Result<Box<dyn Transport>, TransportError> {
    let transport: Box<dyn Transport> = match config.reporting.transport {
        TransportKind::LocalFilesystem => Box::new(LocalFilesystem::new(
            &config.spool.path,
            config.spool.poll_interval(),
        )?),
        TransportKind::DirectStore => Box::new(DirectStore::new(storage::from_config(config)?)),
    };

    tracing::debug!(transport = transport.name(), "Loaded transport");
    Ok(transport)
}
