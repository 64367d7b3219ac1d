//! Termination flag shared between the main loop and everything that may stop it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable handle to a running collector.
///
/// Handed to the transport's monitor and to signal handlers. Requesting
/// shutdown only sets the termination flag; the loop notices it before its
/// next fetch and releases the transport and storage itself. The flag never
/// clears once set.
#[derive(Debug, Clone, Default)]
pub struct CollectorHandle {
    terminate: Arc<AtomicBool>,
}

impl CollectorHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the collector to stop. Safe from any thread, any number of times.
    pub fn request_shutdown(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }
}
