//! Bounds `vm.post` dispatch concurrency to `VmConfig::pool_size` (spec §6
//! `vm.pool.size`, §9 "worker-pool backpressure").

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A counting semaphore gating how many `vm.post` dispatches may run at
/// once. Acquiring a permit never blocks commit or retirement — only the
/// spawned `vm.post` task itself waits on it.
pub struct PostPool {
    semaphore: Arc<Semaphore>,
}

impl PostPool {
    /// Construct a pool admitting at most `size` concurrent `vm.post`
    /// dispatches. `size` is floored at 1 so a misconfigured `0` does not
    /// deadlock every evaluation.
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Acquire a permit, waiting if the pool is fully occupied. The
    /// returned permit is released on drop.
    pub async fn acquire_owned(&self) -> OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("PostPool semaphore is never closed")
    }

    /// How many permits are currently available.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
