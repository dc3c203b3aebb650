//! Non-waiting re-entrancy guard backed by a single-permit tokio Semaphore.
//!
//! Used around `start()` and around each recovery tier: a second caller that
//! arrives while an operation is in flight is turned away instead of queued.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A single-permit guard. Holding the returned [`GuardPermit`] marks the
/// guarded operation as in flight; dropping it releases the guard.
#[derive(Clone)]
pub struct ReentrancyGuard {
    name: &'static str,
    semaphore: Arc<Semaphore>,
}

/// Proof that the guarded operation is in flight. Owned, so it can move
/// into a spawned task.
#[derive(Debug)]
pub struct GuardPermit {
    _permit: OwnedSemaphorePermit,
}

impl ReentrancyGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Returns `None` (and logs) if the operation is already in flight.
    pub fn try_enter(&self) -> Option<GuardPermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(GuardPermit { _permit: permit }),
            Err(_) => {
                tracing::debug!(guard = self.name, "Operation already in flight, ignoring");
                None
            }
        }
    }
}
