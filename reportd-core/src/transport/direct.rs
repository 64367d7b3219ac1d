//! In-process transport that writes straight to storage
//!
//! Interactions handed to `store` are queued to a worker thread that owns the
//! storage backend. The worker starts with the monitor or the first `store`,
//! and validates the backend before its first write. Nothing is ever
//! available to `fetch`, so this transport cannot feed a collector.

use super::Transport;
use crate::collector::CollectorHandle;
use crate::error::{StorageError, TransportError};
use crate::storage::Storage;
use crate::types::Interaction;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// Direct-to-storage [`Transport`].
pub struct DirectStore {
    /// Held here until the worker takes it
    storage: Option<Box<dyn Storage>>,
    queue: Option<Sender<Interaction>>,
    worker: Option<JoinHandle<Result<(), StorageError>>>,
    closed: bool,
}

impl DirectStore {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self {
            storage: Some(storage),
            queue: None,
            worker: None,
            closed: false,
        }
    }

    fn start_worker(&mut self) -> Result<&Sender<Interaction>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.queue.is_none() {
            let storage = self.storage.take().ok_or(TransportError::Closed)?;
            let (queue, rx) = mpsc::channel::<Interaction>();
            let worker = thread::Builder::new()
                .name("direct-store".to_string())
                .spawn(move || store_all(storage, rx))?;
            self.queue = Some(queue);
            self.worker = Some(worker);
        }
        self.queue.as_ref().ok_or(TransportError::Closed)
    }
}

fn store_all(mut storage: Box<dyn Storage>, rx: Receiver<Interaction>) -> Result<(), StorageError> {
    if let Err(e) = storage.validate() {
        tracing::error!(storage = storage.name(), error = %e, "Storage failed to validate");
    }
    for interaction in rx {
        if let Err(e) = storage.import_interaction(&interaction) {
            tracing::error!(
                host = interaction.label(),
                storage = storage.name(),
                error = %e,
                "Failed to store interaction"
            );
        }
    }
    storage.shutdown()
}

impl Transport for DirectStore {
    fn name(&self) -> &'static str {
        "direct_store"
    }

    fn is_direct(&self) -> bool {
        true
    }

    fn start_monitor(&mut self, _collector: CollectorHandle) -> Result<(), TransportError> {
        self.start_worker().map(|_| ())
    }

    fn fetch(&mut self) -> Result<Option<Interaction>, TransportError> {
        Err(TransportError::Unsupported {
            transport: self.name(),
            operation: "fetch",
        })
    }

    fn store(&mut self, interaction: Interaction) -> Result<(), TransportError> {
        self.start_worker()?
            .send(interaction)
            .map_err(|_| TransportError::Closed)
    }

    fn shutdown(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        // Closing the queue lets the worker drain it and exit.
        self.queue.take();

        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| io::Error::other("storage worker thread panicked"))??;
        }
        if let Some(mut storage) = self.storage.take() {
            storage.shutdown()?;
        }
        Ok(())
    }
}

impl Drop for DirectStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "Direct store shutdown failed");
        }
    }
}
