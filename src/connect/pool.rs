/// Per-origin connection slot accounting
///
/// Each origin carries an active-connection count checked against the
/// cap of the policy in effect for that call, so two backends (or a
/// per-call policy override) sharing an origin each get their own hard
/// limit. Callers that find the pool full either fail fast or queue,
/// with the number of queued waiters itself bounded by the policy; a
/// slot travels with the pooled connection and is released when the
/// connection is dropped, so a timed-out or failed dial can never leak
/// a slot.
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::core::policy::{ConnectionPolicy, PendingStrategy};
use crate::error::ConnectError;

#[derive(Clone, Default)]
struct PoolSlot {
    active: Arc<AtomicUsize>,
    pending: Arc<AtomicUsize>,
    released: Arc<Notify>,
}

impl PoolSlot {
    /// Claim a slot if the active count is below `cap`
    fn try_reserve(&self, cap: usize) -> Option<PoolPermit> {
        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current >= cap {
                return None;
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(PoolPermit {
                        active: Arc::clone(&self.active),
                        released: Arc::clone(&self.released),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// One claimed connection slot; dropping it frees the slot and wakes
/// queued waiters
#[derive(Debug)]
pub struct PoolPermit {
    active: Arc<AtomicUsize>,
    released: Arc<Notify>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.released.notify_waiters();
    }
}

/// Connection slot pools for every origin the connector has seen
#[derive(Default)]
pub struct OriginPools {
    slots: DashMap<String, PoolSlot>,
}

/// Decrements the pending-waiter count when a queued acquire finishes,
/// completes or is cancelled alike
struct PendingGuard {
    pending: Arc<AtomicUsize>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

impl OriginPools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a connection slot for `origin_id` under `policy`.
    ///
    /// The cap is the calling policy's `max_connections_per_origin`,
    /// re-checked on every acquire, so a tighter policy is enforced
    /// even when the origin was first dialed under a looser one. The
    /// returned permit must be held for the lifetime of the
    /// connection. Queued waits are unbounded here; the caller bounds
    /// the whole acquire-and-dial sequence with the response timeout.
    pub async fn acquire(
        &self,
        origin_id: &str,
        policy: &ConnectionPolicy,
    ) -> Result<PoolPermit, ConnectError> {
        let slot = self
            .slots
            .entry(origin_id.to_string())
            .or_default()
            .value()
            .clone();

        if let Some(permit) = slot.try_reserve(policy.max_connections_per_origin) {
            return Ok(permit);
        }

        if policy.pending_strategy == PendingStrategy::FailFast {
            return Err(ConnectError::pool_exhausted(origin_id));
        }

        // Backpressure: cap the number of queued waiters
        if slot.pending.fetch_add(1, Ordering::SeqCst) >= policy.max_pending_per_origin {
            slot.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectError::pool_exhausted(origin_id));
        }
        let _pending = PendingGuard {
            pending: Arc::clone(&slot.pending),
        };

        // Register for the release notification before re-checking so a
        // slot freed between the check and the await cannot be missed
        let mut released = pin!(slot.released.notified());
        loop {
            released.as_mut().enable();
            if let Some(permit) = slot.try_reserve(policy.max_connections_per_origin) {
                return Ok(permit);
            }
            released.as_mut().await;
            released.set(slot.released.notified());
        }
    }

    /// Connections currently held for an origin
    pub fn active(&self, origin_id: &str) -> usize {
        self.slots
            .get(origin_id)
            .map(|slot| slot.active.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Waiters currently queued for an origin
    pub fn pending(&self, origin_id: &str) -> usize {
        self.slots
            .get(origin_id)
            .map(|slot| slot.pending.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(max: usize, pending: usize, strategy: PendingStrategy) -> ConnectionPolicy {
        ConnectionPolicy {
            max_connections_per_origin: max,
            max_pending_per_origin: pending,
            pending_strategy: strategy,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_up_to_cap() {
        let pools = OriginPools::new();
        let policy = policy(2, 0, PendingStrategy::FailFast);

        let first = pools.acquire("o1", &policy).await.unwrap();
        let _second = pools.acquire("o1", &policy).await.unwrap();
        assert_eq!(pools.active("o1"), 2);

        let third = pools.acquire("o1", &policy).await;
        assert!(matches!(third, Err(ConnectError::PoolExhausted { .. })));

        // Releasing a slot makes room again
        drop(first);
        assert!(pools.acquire("o1", &policy).await.is_ok());
    }

    #[tokio::test]
    async fn test_pools_are_per_origin() {
        let pools = OriginPools::new();
        let policy = policy(1, 0, PendingStrategy::FailFast);

        let _held = pools.acquire("o1", &policy).await.unwrap();
        assert!(pools.acquire("o2", &policy).await.is_ok());
    }

    #[tokio::test]
    async fn test_cap_follows_the_policy_in_effect() {
        let pools = OriginPools::new();
        let loose = policy(5, 0, PendingStrategy::FailFast);
        let tight = policy(1, 0, PendingStrategy::FailFast);

        // The origin is first dialed under the loose cap; a later call
        // under the tight cap must still be bounded by its own policy
        let held = pools.acquire("o1", &loose).await.unwrap();
        let blocked = pools.acquire("o1", &tight).await;
        assert!(matches!(blocked, Err(ConnectError::PoolExhausted { .. })));

        // The loose policy still sees free capacity on the same origin
        let second = pools.acquire("o1", &loose).await.unwrap();
        drop(second);

        drop(held);
        assert!(pools.acquire("o1", &tight).await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_waits_for_release() {
        let pools = Arc::new(OriginPools::new());
        let policy = policy(1, 5, PendingStrategy::Queue);

        let held = pools.acquire("o1", &policy).await.unwrap();

        let waiter = {
            let pools = Arc::clone(&pools);
            let policy = policy.clone();
            tokio::spawn(async move { pools.acquire("o1", &policy).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pools.pending("o1"), 1);

        drop(held);
        let permit = waiter.await.unwrap();
        assert!(permit.is_ok());
        assert_eq!(pools.pending("o1"), 0);
    }

    #[tokio::test]
    async fn test_pending_cap_fails_fast() {
        let pools = Arc::new(OriginPools::new());
        let policy = policy(1, 1, PendingStrategy::Queue);

        let _held = pools.acquire("o1", &policy).await.unwrap();

        // First waiter queues
        let waiter = {
            let pools = Arc::clone(&pools);
            let policy = policy.clone();
            tokio::spawn(async move { pools.acquire("o1", &policy).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Second waiter exceeds the pending cap
        let result = pools.acquire("o1", &policy).await;
        assert!(matches!(result, Err(ConnectError::PoolExhausted { .. })));

        waiter.abort();
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_pending_slot() {
        let pools = Arc::new(OriginPools::new());
        let policy = policy(1, 1, PendingStrategy::Queue);

        let _held = pools.acquire("o1", &policy).await.unwrap();

        let waiter = {
            let pools = Arc::clone(&pools);
            let policy = policy.clone();
            tokio::spawn(async move { pools.acquire("o1", &policy).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pools.pending("o1"), 1);

        // Simulates a caller-side timeout dropping the acquire future
        waiter.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pools.pending("o1"), 0);
    }
}
