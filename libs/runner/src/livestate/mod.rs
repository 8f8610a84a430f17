//! Live-state plumbing shared between the per-cloud stores and the
//! reporter.
//!
//! Stores push observed changes onto a bounded queue owned here; the
//! reporter drains it toward the control plane. On overflow the oldest
//! events are dropped and counted, so a slow control plane can never block
//! a watcher.

pub mod reporter;

pub use reporter::LiveStateReporter;

use crate::metrics::Metrics;

use piped_api_client::rpc::LiveStateEvent;
use piped_model::Manifest;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1000;

/// Immutable snapshot of the live resources of one application.
#[derive(Clone, Debug, Default)]
pub struct AppLiveState {
    pub resources: Vec<Manifest>,
}

/// Read access to a per-cloud live-state cache. Calls never block on the
/// underlying watch machinery.
pub trait LiveStateGetter: Send + Sync {
    /// None while the snapshot for the application is not populated yet.
    fn get(&self, application_id: &str) -> Option<AppLiveState>;
}

/// Bounded drop-oldest queue connecting live-state stores to the reporter.
#[derive(Clone)]
pub struct LiveStateEventQueue {
    inner: Arc<Mutex<VecDeque<LiveStateEvent>>>,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl LiveStateEventQueue {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
            metrics,
        }
    }

    pub fn push(&self, event: LiveStateEvent) {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.metrics.livestate_dropped_events.inc();
        }
        queue.push_back(event);
    }

    pub fn drain(&self, max: usize) -> Vec<LiveStateEvent> {
        let mut queue = self.inner.lock();
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use piped_api_client::rpc::LiveStateEventType;
    use piped_model::ResourceKey;

    fn event(name: &str) -> LiveStateEvent {
        LiveStateEvent {
            application_id: "app-1".to_string(),
            event_type: LiveStateEventType::Updated,
            resource_key: ResourceKey {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                namespace: "default".to_string(),
                name: name.to_string(),
            },
            state: None,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts() {
        let metrics = Metrics::new();
        let queue = LiveStateEventQueue::new(3, metrics.clone());
        for i in 0..5 {
            queue.push(event(&format!("r{i}")));
        }
        assert_eq!(queue.len(), 3);
        let drained = queue.drain(10);
        assert_eq!(drained[0].resource_key.name, "r2");
        let text = metrics.encode().unwrap();
        assert!(text.contains("piped_livestate_dropped_events_total 2"));
    }

    #[test]
    fn test_drain_respects_max() {
        let metrics = Metrics::new();
        let queue = LiveStateEventQueue::new(10, metrics);
        for i in 0..4 {
            queue.push(event(&format!("r{i}")));
        }
        assert_eq!(queue.drain(2).len(), 2);
        assert_eq!(queue.len(), 2);
    }
}
