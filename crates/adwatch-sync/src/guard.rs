use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Admits at most one ingestion pass at a time. Acquisition never waits.
#[derive(Debug, Clone)]
pub struct RunGuard {
    slot: Arc<Semaphore>,
}

impl Default for RunGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl RunGuard {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Returns `None` when a pass already holds the guard.
    pub fn try_acquire(&self) -> Option<RunPermit> {
        Arc::clone(&self.slot)
            .try_acquire_owned()
            .ok()
            .map(|permit| RunPermit {
                permit: Some(permit),
            })
    }

    pub fn is_held(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

/// Proof of exclusive admission. Dropping it releases the guard.
#[derive(Debug)]
pub struct RunPermit {
    permit: Option<OwnedSemaphorePermit>,
}

impl RunPermit {
    /// Releasing twice is a no-op.
    pub fn release(&mut self) {
        self.permit.take();
    }

    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let guard = RunGuard::new();
        let mut first = guard.try_acquire().expect("first acquire");
        assert!(guard.is_held());
        assert!(guard.try_acquire().is_none());

        first.release();
        first.release();
        assert!(first.is_released());
        assert!(!guard.is_held());

        let second = guard.try_acquire().expect("acquire after release");
        drop(second);
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn clones_share_the_same_slot() {
        let guard = RunGuard::new();
        let other = guard.clone();
        let _permit = guard.try_acquire().expect("acquire");
        assert!(other.try_acquire().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_admit_exactly_one() {
        let guard = RunGuard::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let permit = guard.try_acquire();
                let admitted = permit.is_some();
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                drop(permit);
                admitted
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
