//! Storage backends for jobs, purchases, presence, and the provider directory.

pub mod memory;

pub use memory::{MemoryDirectory, MemoryJobStore, MemoryLedger, MemoryPresence};

use std::sync::Arc;

use crate::notify::NotificationHub;
use crate::traits::Backends;

/// Every collaborator held in process memory.
///
/// Keeps the concrete handles so callers can seed purchases, presence, and
/// the directory while the server runs against the trait objects.
#[derive(Clone, Default)]
pub struct InMemoryBackends {
    pub jobs: Arc<MemoryJobStore>,
    pub ledger: Arc<MemoryLedger>,
    pub presence: Arc<MemoryPresence>,
    pub directory: Arc<MemoryDirectory>,
    pub hub: Arc<NotificationHub>,
}

impl InMemoryBackends {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn backends(&self) -> Backends {
        Backends {
            jobs: self.jobs.clone(),
            ledger: self.ledger.clone(),
            presence: self.presence.clone(),
            directory: self.directory.clone(),
            channel: self.hub.clone(),
        }
    }
}
