//! Locally cached views of control-plane entities.
//!
//! Each store runs a background refresh loop pulling its entity set into a
//! keyed map. Readers get copy-on-write snapshots: a refresh builds a fresh
//! map and swaps the `Arc`, so concurrent readers always observe a
//! consistent point-in-time view and never take the write lock. On refresh
//! failure the prior snapshot is retained.

pub mod application;
pub mod command;
pub mod deployment;
pub mod environment;
pub mod event;

pub use application::{ApplicationLister, ApplicationStore};
pub use command::{CommandLister, CommandStore};
pub use deployment::{DeploymentLister, DeploymentStore};
pub use environment::EnvironmentStore;
pub use event::{EventLister, EventStore};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Copy-on-write cell holding the snapshot of one entity set.
pub(crate) struct EntityCell<T> {
    map: RwLock<Arc<HashMap<String, Arc<T>>>>,
    version: watch::Sender<u64>,
}

impl<T> EntityCell<T> {
    pub(crate) fn new() -> Arc<Self> {
        let (version, _) = watch::channel(0);
        Arc::new(Self {
            map: RwLock::new(Arc::new(HashMap::new())),
            version,
        })
    }

    pub(crate) fn snapshot(&self) -> Arc<HashMap<String, Arc<T>>> {
        self.map.read().clone()
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<T>> {
        self.map.read().get(id).cloned()
    }

    pub(crate) fn replace(&self, next: HashMap<String, Arc<T>>) {
        *self.map.write() = Arc::new(next);
        self.version.send_modify(|v| *v += 1);
    }

    /// Change notification: the watched value bumps on every snapshot swap.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_point_in_time() {
        let cell: Arc<EntityCell<String>> = EntityCell::new();
        let mut first = HashMap::new();
        first.insert("a".to_string(), Arc::new("1".to_string()));
        cell.replace(first);

        let old = cell.snapshot();
        let mut second = HashMap::new();
        second.insert("b".to_string(), Arc::new("2".to_string()));
        cell.replace(second);

        // the old snapshot is unaffected by the swap
        assert!(old.contains_key("a"));
        assert!(!old.contains_key("b"));
        assert!(cell.snapshot().contains_key("b"));
    }

    #[test]
    fn test_subscribe_sees_version_bumps() {
        let cell: Arc<EntityCell<String>> = EntityCell::new();
        let rx = cell.subscribe();
        assert_eq!(*rx.borrow(), 0);
        cell.replace(HashMap::new());
        assert_eq!(*rx.borrow(), 1);
    }
}
