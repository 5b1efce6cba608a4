use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A fixed-size pool of session slots. Acquiring never waits: when every slot is taken
/// the caller is turned away.
#[derive(Clone, Debug)]
pub struct SessionSlots {
    semaphore: Arc<Semaphore>,
}

/// A held slot. Dropping it returns the slot to the pool.
#[derive(Debug)]
pub struct SessionSlot {
    _permit: OwnedSemaphorePermit,
}

impl SessionSlots {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }

    #[must_use]
    pub fn try_acquire(&self) -> Option<SessionSlot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| SessionSlot { _permit: permit })
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
