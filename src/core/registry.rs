/// Concurrently-readable, atomically-updatable routing table
///
/// The registry publishes an immutable table through an atomic pointer
/// swap: readers take a wait-free snapshot and never observe a partial
/// update, writers serialize on a single mutex and replace the whole
/// table generation on every change.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::core::backend::BackendDescriptor;
use crate::error::{PorticoError, PorticoResult};

/// One published generation of the routing table.
///
/// Immutable once handed out; later registry updates never change a
/// snapshot a resolver already holds.
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: HashMap<String, Arc<BackendDescriptor>>,
}

impl RouteTable {
    fn with_entries(entries: HashMap<String, Arc<BackendDescriptor>>) -> Self {
        Self { entries }
    }

    pub fn get(&self, prefix: &str) -> Option<&Arc<BackendDescriptor>> {
        self.entries.get(prefix)
    }

    /// Longest-matching-prefix lookup. Distinct prefixes of equal length
    /// cannot both match one path, so the longest match is unique.
    pub fn resolve(&self, path: &str) -> Option<&Arc<BackendDescriptor>> {
        self.entries
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, descriptor)| descriptor)
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<BackendDescriptor>)> {
        self.entries
            .iter()
            .map(|(prefix, descriptor)| (prefix.as_str(), descriptor))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Dynamic `path prefix -> descriptor` mapping supporting hot
/// reconfiguration while requests are being served.
pub struct BackendRegistry {
    table: ArcSwap<RouteTable>,
    // Single-writer discipline; readers never touch this lock
    write: Mutex<()>,
    generation: AtomicU64,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::default()),
            write: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Install or replace the descriptor for one prefix. Atomic with
    /// respect to concurrent `snapshot`/`resolve` calls.
    pub fn put(&self, prefix: impl Into<String>, descriptor: BackendDescriptor) {
        let prefix = prefix.into();
        let descriptor = Arc::new(descriptor);
        let _writer = self.write.lock().unwrap_or_else(|e| e.into_inner());

        let mut entries = self.table.load().entries.clone();
        let replaced = entries.insert(prefix.clone(), descriptor).is_some();
        self.publish(entries);

        debug!(
            "route {} {} (generation {})",
            if replaced { "replaced" } else { "installed" },
            prefix,
            self.generation()
        );
    }

    /// Define the whole routing table in one atomic generation swap.
    /// A duplicate prefix within the batch is a configuration error and
    /// leaves the previous table untouched.
    pub fn put_all(
        &self,
        entries: impl IntoIterator<Item = (String, BackendDescriptor)>,
    ) -> PorticoResult<()> {
        let mut table = HashMap::new();
        for (prefix, descriptor) in entries {
            if table.insert(prefix.clone(), Arc::new(descriptor)).is_some() {
                return Err(PorticoError::duplicate_route(prefix));
            }
        }

        let _writer = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let count = table.len();
        self.publish(table);
        info!("routing table replaced: {} routes (generation {})", count, self.generation());
        Ok(())
    }

    /// Remove a route; later resolutions for that prefix fail with a
    /// no-route error. Returns the removed descriptor, if any.
    pub fn remove(&self, prefix: &str) -> Option<Arc<BackendDescriptor>> {
        let _writer = self.write.lock().unwrap_or_else(|e| e.into_inner());

        let mut entries = self.table.load().entries.clone();
        let removed = entries.remove(prefix);
        if removed.is_some() {
            self.publish(entries);
            debug!("route removed: {} (generation {})", prefix, self.generation());
        }
        removed
    }

    /// Wait-free point-in-time view for the lifetime of one resolution
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// Monotonic counter bumped on every published table
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn publish(&self, entries: HashMap<String, Arc<BackendDescriptor>>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.table.store(Arc::new(RouteTable::with_entries(entries)));
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
