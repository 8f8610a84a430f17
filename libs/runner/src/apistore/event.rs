use super::EntityCell;
use crate::error::Result;
use crate::metrics::{Metrics, StoreLabels};
use crate::supervisor::Component;

use piped_api_client::ApiClient;
use piped_model::Event;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cache keeping the latest event per (name, labels) series.
pub struct EventStore {
    api: Arc<dyn ApiClient>,
    interval: Duration,
    metrics: Arc<Metrics>,
    cell: Arc<EntityCell<Event>>,
}

impl EventStore {
    pub fn new(api: Arc<dyn ApiClient>, interval: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            api,
            interval,
            metrics,
            cell: EntityCell::new(),
        }
    }

    pub fn lister(&self) -> EventLister {
        EventLister {
            cell: self.cell.clone(),
        }
    }

    pub async fn sync_once(&self) -> Result<()> {
        let events = self
            .api
            .list_events()
            .await
            .map_err(|e| crate::error::Error::Api("list events".to_string(), e))?;
        let mut next: HashMap<String, Arc<Event>> = HashMap::new();
        for event in events {
            let key = event.event_key();
            match next.get(&key) {
                Some(existing) if existing.created_at >= event.created_at => {}
                _ => {
                    next.insert(key, Arc::new(event));
                }
            }
        }
        self.cell.replace(next);
        Ok(())
    }
}

#[async_trait]
impl Component for EventStore {
    fn name(&self) -> &'static str {
        "event-store"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!(msg = "failed to refresh event store", err = %e);
                        self.metrics
                            .store_refresh_failures
                            .get_or_create(&StoreLabels { store: "event".to_string() })
                            .inc();
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct EventLister {
    cell: Arc<EntityCell<Event>>,
}

impl EventLister {
    /// Latest event of the series identified by name and labels.
    pub fn latest(&self, name: &str, labels: &HashMap<String, String>) -> Option<Arc<Event>> {
        self.cell.get(&piped_model::event::series_key(name, labels))
    }
}
