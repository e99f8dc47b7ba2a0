use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::EngineError;

/// RAII guard for one concurrency slot.
///
/// Held by a job's supervisor until the job's terminal state is written.
pub struct Permit {
    /// Owned permit; dropping this struct releases it back to the gate.
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish()
    }
}

/// Global bound on the number of jobs in `Admitted` or `Running`.
///
/// The scheduler awaits [`Self::acquire`] only while it has queued work, so a
/// full gate never stalls submissions.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Wait for a free slot.
    ///
    /// Fails with [`EngineError::Shutdown`] only if the gate was closed.
    pub async fn acquire(&self) -> Result<Permit, EngineError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map(|permit| Permit { permit })
            .map_err(|_| EngineError::Shutdown)
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { permit })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
