//! Concurrency gate for per-backend fan-out.
//!
//! A [`TokenDispenser`] grants at most `n` simultaneous slots. Chunked
//! uploaders take one token per outstanding part so a single large transfer
//! cannot monopolize a backend's connection budget.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Grants at most `n` simultaneous slots.
#[derive(Debug, Clone)]
pub struct TokenDispenser {
    sem: Arc<Semaphore>,
    capacity: usize,
}

/// A held slot; dropping it returns the slot to the dispenser.
#[derive(Debug)]
pub struct TokenGuard {
    _permit: OwnedSemaphorePermit,
}

impl TokenDispenser {
    /// A dispenser with `n` slots. `n == 0` is clamped to 1 so the gate can
    /// never deadlock.
    pub fn new(n: usize) -> Self {
        let capacity = n.max(1);
        TokenDispenser {
            sem: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot.
    pub async fn get(&self) -> TokenGuard {
        // The semaphore is never closed, so acquisition cannot fail.
        let permit = Arc::clone(&self.sem)
            .acquire_owned()
            .await
            .expect("dispenser semaphore closed");
        TokenGuard { _permit: permit }
    }

    /// Take a slot only if one is free right now.
    pub fn try_get(&self) -> Option<TokenGuard> {
        Arc::clone(&self.sem)
            .try_acquire_owned()
            .ok()
            .map(|permit| TokenGuard { _permit: permit })
    }

    /// Total slot count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grants_up_to_capacity() {
        let d = TokenDispenser::new(2);
        let g1 = d.get().await;
        let _g2 = d.get().await;
        assert_eq!(d.available(), 0);
        assert!(d.try_get().is_none());

        drop(g1);
        assert_eq!(d.available(), 1);
        assert!(d.try_get().is_some());
    }

    #[tokio::test]
    async fn test_zero_clamps_to_one() {
        let d = TokenDispenser::new(0);
        assert_eq!(d.capacity(), 1);
        let _g = d.get().await;
        assert!(d.try_get().is_none());
    }

    #[tokio::test]
    async fn test_waiters_wake_on_release() {
        let d = TokenDispenser::new(1);
        let guard = d.get().await;

        let d2 = d.clone();
        let waiter = tokio::spawn(async move {
            let _g = d2.get().await;
            42u32
        });

        drop(guard);
        assert_eq!(waiter.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let d = TokenDispenser::new(3);
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let d = d.clone();
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _g = d.get().await;
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                live.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
