//! The process-scoped context.
//!
//! The shutdown flag, local-number range, tunables, and the in-process
//! message exchange ride in one cloneable context handed to every
//! participant at construction. Tests create isolated contexts so
//! clusters in the same test binary cannot see each other.

use crate::chatterbox::exchange::Exchange;
use elga_api::Tunables;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared per-process state.
#[derive(Debug, Clone)]
pub struct ProcessCtx {
    shutdown: Arc<AtomicBool>,
    /// First local number hosted by this process.
    pub local_base: u16,
    /// One past the last local number hosted by this process.
    pub local_max: u16,
    /// Cluster tunables.
    pub tunables: Arc<Tunables>,
    /// In-process transport registry for same-process peers.
    pub exchange: Arc<Exchange>,
}

impl ProcessCtx {
    /// Build a context for local numbers `[local_base, local_max)`.
    pub fn new(tunables: Tunables, local_base: u16, local_max: u16) -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            local_base,
            local_max,
            tunables: Arc::new(tunables),
            exchange: Arc::new(Exchange::default()),
        }
    }

    /// A context for tests, hosting the given local range.
    pub fn testing(local_base: u16, local_max: u16) -> Self {
        Self::new(Tunables::testing(), local_base, local_max)
    }

    /// Whether a cooperative shutdown has been requested.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request a cooperative shutdown of every loop in the process.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// The shutdown flag itself, for signal handlers.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }
}
