use super::EntityCell;
use crate::error::Result;
use crate::metrics::{Metrics, StoreLabels};
use crate::supervisor::Component;

use piped_api_client::ApiClient;
use piped_model::{Deployment, DeploymentStatus};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cache of the deployments owned by this piped that have not completed.
pub struct DeploymentStore {
    api: Arc<dyn ApiClient>,
    interval: Duration,
    metrics: Arc<Metrics>,
    cell: Arc<EntityCell<Deployment>>,
}

impl DeploymentStore {
    pub fn new(api: Arc<dyn ApiClient>, interval: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            api,
            interval,
            metrics,
            cell: EntityCell::new(),
        }
    }

    pub fn lister(&self) -> DeploymentLister {
        DeploymentLister {
            cell: self.cell.clone(),
        }
    }

    pub async fn sync_once(&self) -> Result<()> {
        let deployments = self
            .api
            .list_not_completed_deployments()
            .await
            .map_err(|e| crate::error::Error::Api("list deployments".to_string(), e))?;
        let next: HashMap<_, _> = deployments
            .into_iter()
            .map(|d| (d.id.clone(), Arc::new(d)))
            .collect();
        self.cell.replace(next);
        Ok(())
    }
}

#[async_trait]
impl Component for DeploymentStore {
    fn name(&self) -> &'static str {
        "deployment-store"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!(msg = "failed to refresh deployment store", err = %e);
                        self.metrics
                            .store_refresh_failures
                            .get_or_create(&StoreLabels { store: "deployment".to_string() })
                            .inc();
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct DeploymentLister {
    cell: Arc<EntityCell<Deployment>>,
}

impl DeploymentLister {
    pub fn list(&self) -> Vec<Arc<Deployment>> {
        self.cell.snapshot().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Deployment>> {
        self.cell.get(id)
    }

    /// The deployment currently converging the application, if any.
    pub fn active_for_application(&self, application_id: &str) -> Option<Arc<Deployment>> {
        self.cell
            .snapshot()
            .values()
            .filter(|d| d.application_id == application_id)
            .filter(|d| {
                matches!(
                    d.status,
                    DeploymentStatus::Planned
                        | DeploymentStatus::Running
                        | DeploymentStatus::RollingBack
                )
            })
            .cloned()
            .min_by_key(|d| d.created_at)
    }

    pub fn exists_for_commit(&self, application_id: &str, commit_hash: &str) -> bool {
        self.cell
            .snapshot()
            .values()
            .any(|d| d.application_id == application_id && d.trigger.commit_hash == commit_hash)
    }

    pub fn list_for_application(&self, application_id: &str) -> Vec<Arc<Deployment>> {
        let mut deployments: Vec<_> = self
            .cell
            .snapshot()
            .values()
            .filter(|d| d.application_id == application_id)
            .cloned()
            .collect();
        deployments.sort_by_key(|d| d.created_at);
        deployments
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.cell.subscribe()
    }
}
