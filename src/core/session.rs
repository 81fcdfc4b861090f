/// Sticky-session affinity management
///
/// Binds a client session token to one origin for a bounded time. A
/// binding moves token through the states Unbound -> Bound(origin,
/// expiry) -> Unbound again when the timeout elapses or the bound origin
/// leaves the origin set (or stops being eligible), after which the next
/// successful connect rebinds.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

/// One client token bound to one origin
#[derive(Debug, Clone)]
pub struct Binding {
    pub origin_id: String,
    pub bound_at: Instant,
    pub expires_at: Instant,
    pub connection_count: u64,
}

impl Binding {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Tracks session-token affinity across all sticky-enabled backends.
///
/// The binding lifetime comes from each backend's sticky-session policy,
/// so one manager serves every descriptor.
pub struct StickySessionManager {
    bindings: Arc<RwLock<HashMap<String, Binding>>>,
}

impl StickySessionManager {
    pub fn new() -> Self {
        Self {
            bindings: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Return the bound origin for `token` if the binding is live and
    /// `is_eligible` still accepts it; otherwise drop the binding so the
    /// caller falls back to normal selection and rebinds.
    pub async fn lookup(&self, token: &str, is_eligible: impl Fn(&str) -> bool) -> Option<String> {
        let mut bindings = self.bindings.write().await;
        let now = Instant::now();

        match bindings.get_mut(token) {
            Some(binding) if binding.is_expired(now) => {
                debug!("session {} binding expired", fingerprint(token));
                bindings.remove(token);
                None
            }
            Some(binding) if !is_eligible(&binding.origin_id) => {
                debug!(
                    "session {} bound origin {} no longer eligible",
                    fingerprint(token),
                    binding.origin_id
                );
                bindings.remove(token);
                None
            }
            Some(binding) => {
                binding.connection_count += 1;
                Some(binding.origin_id.clone())
            }
            None => None,
        }
    }

    /// Bind (or renew) `token` to `origin_id` for `ttl`
    pub async fn bind(&self, token: &str, origin_id: &str, ttl: Duration) {
        let now = Instant::now();
        let mut bindings = self.bindings.write().await;

        let binding = bindings
            .entry(token.to_string())
            .or_insert_with(|| Binding {
                origin_id: origin_id.to_string(),
                bound_at: now,
                expires_at: now + ttl,
                connection_count: 0,
            });
        if binding.origin_id != origin_id {
            debug!(
                "session {} rebound {} -> {}",
                fingerprint(token),
                binding.origin_id,
                origin_id
            );
            binding.origin_id = origin_id.to_string();
            binding.bound_at = now;
        }
        binding.expires_at = now + ttl;
    }

    pub async fn get(&self, token: &str) -> Option<Binding> {
        self.bindings.read().await.get(token).cloned()
    }

    pub async fn unbind(&self, token: &str) -> Option<Binding> {
        self.bindings.write().await.remove(token)
    }

    /// Drop every expired binding, returning how many were removed
    pub async fn cleanup_expired(&self) -> usize {
        let mut bindings = self.bindings.write().await;
        let now = Instant::now();
        let before = bindings.len();
        bindings.retain(|_, binding| !binding.is_expired(now));
        before - bindings.len()
    }

    pub async fn binding_count(&self) -> usize {
        self.bindings.read().await.len()
    }

    /// Bindings per origin, for diagnostics
    pub async fn distribution(&self) -> HashMap<String, usize> {
        let bindings = self.bindings.read().await;
        let mut counts = HashMap::new();
        for binding in bindings.values() {
            *counts.entry(binding.origin_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Background task dropping expired bindings on a fixed cadence
    pub async fn start_cleanup_task(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let cleaned = self.cleanup_expired().await;
            if cleaned > 0 {
                debug!("cleaned up {} expired session bindings", cleaned);
            }
        }
    }
}

impl Default for StickySessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Short stable digest of a session token, safe to log
fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_then_lookup_routes_to_same_origin() {
        let manager = StickySessionManager::new();
        manager.bind("token-1", "origin-a", Duration::from_secs(60)).await;

        let bound = manager.lookup("token-1", |_| true).await;
        assert_eq!(bound, Some("origin-a".to_string()));

        let binding = manager.get("token-1").await.unwrap();
        assert_eq!(binding.connection_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_token_is_unbound() {
        let manager = StickySessionManager::new();
        assert_eq!(manager.lookup("nobody", |_| true).await, None);
    }

    #[tokio::test]
    async fn test_expired_binding_unbinds() {
        let manager = StickySessionManager::new();
        manager.bind("token-1", "origin-a", Duration::from_millis(10)).await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.lookup("token-1", |_| true).await, None);
        // The stale binding was dropped, not just skipped
        assert_eq!(manager.binding_count().await, 0);
    }

    #[tokio::test]
    async fn test_ineligible_origin_unbinds() {
        let manager = StickySessionManager::new();
        manager.bind("token-1", "origin-a", Duration::from_secs(60)).await;

        // Bound origin removed from the set: fall back to normal selection
        assert_eq!(manager.lookup("token-1", |id| id != "origin-a").await, None);
        assert_eq!(manager.binding_count().await, 0);

        // Rebinding to a surviving member works
        manager.bind("token-1", "origin-b", Duration::from_secs(60)).await;
        assert_eq!(
            manager.lookup("token-1", |_| true).await,
            Some("origin-b".to_string())
        );
    }

    #[tokio::test]
    async fn test_rebind_replaces_origin_and_renews() {
        let manager = StickySessionManager::new();
        manager.bind("token-1", "origin-a", Duration::from_secs(60)).await;
        manager.bind("token-1", "origin-b", Duration::from_secs(60)).await;

        let binding = manager.get("token-1").await.unwrap();
        assert_eq!(binding.origin_id, "origin-b");
        assert_eq!(manager.binding_count().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let manager = StickySessionManager::new();
        manager.bind("short", "origin-a", Duration::from_millis(10)).await;
        manager.bind("long", "origin-b", Duration::from_secs(60)).await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.cleanup_expired().await, 1);
        assert_eq!(manager.binding_count().await, 1);
        assert!(manager.get("long").await.is_some());
    }

    #[tokio::test]
    async fn test_distribution() {
        let manager = StickySessionManager::new();
        manager.bind("t1", "origin-a", Duration::from_secs(60)).await;
        manager.bind("t2", "origin-a", Duration::from_secs(60)).await;
        manager.bind("t3", "origin-b", Duration::from_secs(60)).await;

        let distribution = manager.distribution().await;
        assert_eq!(distribution["origin-a"], 2);
        assert_eq!(distribution["origin-b"], 1);
    }
}
