use super::EntityCell;
use crate::error::Result;
use crate::metrics::{Metrics, StoreLabels};
use crate::supervisor::Component;

use piped_api_client::ApiClient;
use piped_model::Application;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct ApplicationStore {
    api: Arc<dyn ApiClient>,
    interval: Duration,
    metrics: Arc<Metrics>,
    cell: Arc<EntityCell<Application>>,
}

impl ApplicationStore {
    pub fn new(api: Arc<dyn ApiClient>, interval: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            api,
            interval,
            metrics,
            cell: EntityCell::new(),
        }
    }

    pub fn lister(&self) -> ApplicationLister {
        ApplicationLister {
            cell: self.cell.clone(),
        }
    }

    pub async fn sync_once(&self) -> Result<()> {
        let applications = self
            .api
            .list_applications()
            .await
            .map_err(|e| crate::error::Error::Api("list applications".to_string(), e))?;
        let next: HashMap<_, _> = applications
            .into_iter()
            .map(|a| (a.id.clone(), Arc::new(a)))
            .collect();
        self.cell.replace(next);
        Ok(())
    }
}

#[async_trait]
impl Component for ApplicationStore {
    fn name(&self) -> &'static str {
        "application-store"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!(msg = "failed to refresh application store", err = %e);
                        self.metrics
                            .store_refresh_failures
                            .get_or_create(&StoreLabels { store: "application".to_string() })
                            .inc();
                    }
                }
            }
        }
    }
}

/// Read-only snapshot access to the cached applications.
#[derive(Clone)]
pub struct ApplicationLister {
    cell: Arc<EntityCell<Application>>,
}

impl ApplicationLister {
    pub fn list(&self) -> Vec<Arc<Application>> {
        self.cell.snapshot().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Application>> {
        self.cell.get(id)
    }

    pub fn list_by_repo(&self, repo_id: &str) -> Vec<Arc<Application>> {
        self.cell
            .snapshot()
            .values()
            .filter(|a| a.git_path.repo_id == repo_id)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.cell.subscribe()
    }
}
