//! # Admission control
//!
//! A fixed pool of *N* slots, one per connection handler allowed to run at the
//! same time. The acceptor loop takes a slot before it dispatches a handler and
//! the handler gives it back when it is done, so once the pool is empty the
//! acceptor itself stops and further clients wait in the OS backlog.
//!
//! Slots are owned values: a slot goes back to the pool when it is released or
//! dropped, whichever comes first, and never twice.

use std::sync::Arc;

use log::trace;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error_handling::types::AdmissionError;

/// Counting pool of handler slots. Clones share the same pool.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionController {
    /// Creates a pool with `capacity` slots, all available.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` exceeds [`Semaphore::MAX_PERMITS`]; configuration
    /// validation rejects such values first.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits until a slot is free and takes it.
    ///
    /// There is no timeout. The only failure is [`AdmissionError::Closed`],
    /// returned once [`close`](Self::close) has been called; it is final and
    /// the caller must not go on without a slot.
    pub async fn acquire(&self) -> Result<AdmissionSlot, AdmissionError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)?;

        trace!(
            "admission slot granted, {} of {} left",
            self.available(),
            self.capacity
        );
        Ok(AdmissionSlot { permit })
    }

    /// Takes a slot only if one is free right now.
    #[cfg(test)]
    pub(crate) fn try_acquire(&self) -> Option<AdmissionSlot> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionSlot { permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }

    /// Fails every pending and future [`acquire`](Self::acquire). Slots
    /// already granted stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

/// Permission for one handler to run.
#[derive(Debug)]
pub struct AdmissionSlot {
    permit: OwnedSemaphorePermit,
}

impl AdmissionSlot {
    /// Gives the slot back to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        trace!(
            "admission slot released ({} permit(s))",
            self.permit.num_permits()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_new_pool_is_full() {
        let admission = AdmissionController::new(3);
        assert_eq!(admission.capacity(), 3);
        assert_eq!(admission.available(), 3);
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let admission = AdmissionController::new(2);

        let a = admission.acquire().await.unwrap();
        let b = admission.acquire().await.unwrap();
        assert_eq!(admission.available(), 0);
        assert_eq!(admission.in_flight(), 2);
        assert!(admission.try_acquire().is_none());

        a.release();
        assert_eq!(admission.available(), 1);
        drop(b);
        assert_eq!(admission.available(), 2);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let admission = AdmissionController::new(1);
        let held = admission.acquire().await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        held.release();
        let slot = timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter timed out")
            .unwrap()
            .unwrap();
        assert_eq!(admission.in_flight(), 1);
        drop(slot);
        assert_eq!(admission.available(), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_acquire() {
        let admission = AdmissionController::new(1);
        let _held = admission.acquire().await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        admission.close();
        let res = timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter timed out")
            .unwrap();
        assert!(matches!(res, Err(AdmissionError::Closed)));
        assert!(admission.is_closed());
    }

    #[tokio::test]
    async fn test_available_never_exceeds_capacity() {
        let admission = AdmissionController::new(4);
        let slots: Vec<_> = (0..4).filter_map(|_| admission.try_acquire()).collect();
        assert_eq!(slots.len(), 4);

        for slot in slots {
            slot.release();
            assert!(admission.available() <= admission.capacity());
        }
        assert_eq!(admission.available(), 4);
    }
}
