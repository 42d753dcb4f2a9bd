use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{BatchError, Result};

/// Shared in-flight counter capping how many calls a pod runs at once.
///
/// A slot is a semaphore permit; it is given back when the returned
/// [`SlotGuard`] is dropped, wherever the guard ended up (typically inside a
/// detached execution task).
#[derive(Debug)]
pub struct SlotCounter {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl SlotCounter {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<SlotGuard> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .ok()
            .map(|permit| SlotGuard { _permit: permit })
    }

    /// Wait until a slot is free and take it.
    pub async fn acquire(&self) -> Result<SlotGuard> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BatchError::Shutdown)?;
        Ok(SlotGuard { _permit: permit })
    }
}

/// One occupied slot; dropping it frees the slot.
#[derive(Debug)]
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
}
