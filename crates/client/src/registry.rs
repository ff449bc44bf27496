//! Live-tunnel registry
//!
//! Tracks every tunnel from construction until teardown begins, so a
//! client shutdown can be broadcast to all of them at once. Entries are
//! shutdown handles, not tunnels; ownership of a tunnel stays with its
//! driver task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
pub struct Registry {
    tunnels: Mutex<HashMap<u64, Arc<Notify>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tunnel's shutdown handle; returns its id.
    pub fn register(&self, handle: Arc<Notify>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tunnels.lock().insert(id, handle);
        id
    }

    /// Remove a tunnel at teardown. Idempotent.
    pub fn remove(&self, id: u64) {
        self.tunnels.lock().remove(&id);
    }

    /// Signal shutdown to every live tunnel.
    pub fn shutdown_all(&self) {
        let handles: Vec<Arc<Notify>> = self.tunnels.lock().values().cloned().collect();
        debug!("broadcasting shutdown to {} tunnels", handles.len());
        for handle in handles {
            handle.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_remove() {
        let registry = Registry::new();
        let a = registry.register(Arc::new(Notify::new()));
        let b = registry.register(Arc::new(Notify::new()));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        registry.remove(a);
        registry.remove(a);
        assert_eq!(registry.len(), 1);
        registry.remove(b);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_all_reaches_every_handle() {
        let registry = Registry::new();
        let handles: Vec<Arc<Notify>> = (0..3).map(|_| Arc::new(Notify::new())).collect();
        for handle in &handles {
            registry.register(handle.clone());
        }

        registry.shutdown_all();

        // notify_one stores a permit, so a later await still observes it.
        for handle in handles {
            tokio::time::timeout(std::time::Duration::from_secs(1), handle.notified())
                .await
                .expect("shutdown signal not delivered");
        }
    }
}
