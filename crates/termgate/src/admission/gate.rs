//! Global cap on concurrently active shell sessions.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Message shown to a client turned away by the gate.
pub const MAX_SESSIONS_MESSAGE: &str = "max sessions exceeded";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("max sessions exceeded ({max})")]
    Exhausted { max: usize },

    #[error("admission gate closed")]
    Closed,
}

/// Counting semaphore sized to the maximum number of live sessions.
#[derive(Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl AdmissionGate {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Take a slot without waiting.
    ///
    /// Fails immediately when every slot is in use; callers close the
    /// connection before allocating any per-session state.
    pub fn try_acquire(&self) -> Result<AdmissionPermit, AdmissionError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(AdmissionPermit {
                slot: Arc::new(Mutex::new(Some(permit))),
            }),
            Err(TryAcquireError::NoPermits) => Err(AdmissionError::Exhausted { max: self.max }),
            Err(TryAcquireError::Closed) => Err(AdmissionError::Closed),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Number of sessions currently holding a slot.
    pub fn active(&self) -> usize {
        self.max.saturating_sub(self.semaphore.available_permits())
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A held session slot.
///
/// Clones share the same slot. `release` may be called from any clone, any
/// number of times, concurrently; the slot goes back exactly once. Dropping
/// the last clone releases it too, so unwinding out of a panicking handler
/// cannot leak it.
#[derive(Clone)]
pub struct AdmissionPermit {
    slot: Arc<Mutex<Option<OwnedSemaphorePermit>>>,
}

impl AdmissionPermit {
    /// Return the slot. Returns true only for the call that actually released it.
    pub fn release(&self) -> bool {
        let permit = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        permit.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_beyond_capacity() {
        let gate = AdmissionGate::new(2);
        let _a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        assert_eq!(
            gate.try_acquire().err(),
            Some(AdmissionError::Exhausted { max: 2 })
        );
        assert_eq!(gate.active(), 2);
    }

    #[test]
    fn double_release_returns_one_slot() {
        let gate = AdmissionGate::new(1);
        let permit = gate.try_acquire().unwrap();

        assert!(permit.release());
        assert!(!permit.release());
        assert_eq!(gate.available(), 1);

        // Dropping an already-released permit must not add a phantom slot.
        drop(permit);
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn drop_of_last_clone_releases() {
        let gate = AdmissionGate::new(1);
        let permit = gate.try_acquire().unwrap();
        let clone = permit.clone();
        drop(permit);
        assert_eq!(gate.available(), 0);
        drop(clone);
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn released_on_panic_unwind() {
        let gate = AdmissionGate::new(1);
        let permit = gate.try_acquire().unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _held = permit;
            panic!("handler blew up");
        }));

        assert!(result.is_err());
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn racing_releases_never_exceed_capacity() {
        let gate = AdmissionGate::new(3);

        for _ in 0..200 {
            let permit = gate.try_acquire().unwrap();
            let a = permit.clone();
            let b = permit.clone();
            let first = tokio::spawn(async move { a.release() });
            let second = tokio::spawn(async move { b.release() });
            let released = [first.await.unwrap(), second.await.unwrap()];
            assert_eq!(released.iter().filter(|r| **r).count(), 1);
            drop(permit);
            assert_eq!(gate.available(), 3);
        }

        let held: Vec<_> = (0..3).map(|_| gate.try_acquire().unwrap()).collect();
        assert!(gate.try_acquire().is_err());
        drop(held);
    }
}
