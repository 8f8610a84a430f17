use super::EntityCell;
use crate::error::Result;
use crate::metrics::{Metrics, StoreLabels};
use crate::supervisor::Component;

use piped_api_client::rpc::ReportCommandHandledRequest;
use piped_api_client::ApiClient;
use piped_model::{Command, CommandType};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cache of unhandled commands with at-most-once local acknowledgement.
///
/// A command acknowledged through [`CommandLister::ack`] disappears from
/// listings immediately, even before the control plane reflects it on the
/// next refresh.
pub struct CommandStore {
    api: Arc<dyn ApiClient>,
    interval: Duration,
    metrics: Arc<Metrics>,
    cell: Arc<EntityCell<Command>>,
    handled: Arc<Mutex<HashSet<String>>>,
}

impl CommandStore {
    pub fn new(api: Arc<dyn ApiClient>, interval: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            api,
            interval,
            metrics,
            cell: EntityCell::new(),
            handled: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn lister(&self) -> CommandLister {
        CommandLister {
            api: self.api.clone(),
            metrics: self.metrics.clone(),
            cell: self.cell.clone(),
            handled: self.handled.clone(),
        }
    }

    pub async fn sync_once(&self) -> Result<()> {
        let commands = self
            .api
            .list_unhandled_commands()
            .await
            .map_err(|e| crate::error::Error::Api("list commands".to_string(), e))?;
        let next: HashMap<_, _> = commands
            .into_iter()
            .map(|c| (c.id.clone(), Arc::new(c)))
            .collect();
        {
            // forget handled ids that the control plane no longer reports
            let mut handled = self.handled.lock();
            handled.retain(|id| next.contains_key(id));
        }
        self.cell.replace(next);
        Ok(())
    }
}

#[async_trait]
impl Component for CommandStore {
    fn name(&self) -> &'static str {
        "command-store"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!(msg = "failed to refresh command store", err = %e);
                        self.metrics
                            .store_refresh_failures
                            .get_or_create(&StoreLabels { store: "command".to_string() })
                            .inc();
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct CommandLister {
    api: Arc<dyn ApiClient>,
    metrics: Arc<Metrics>,
    cell: Arc<EntityCell<Command>>,
    handled: Arc<Mutex<HashSet<String>>>,
}

impl CommandLister {
    pub fn list(&self) -> Vec<Arc<Command>> {
        let handled = self.handled.lock();
        self.cell
            .snapshot()
            .values()
            .filter(|c| !c.handled && !handled.contains(&c.id))
            .cloned()
            .collect()
    }

    pub fn list_by_type(&self, command_type: CommandType) -> Vec<Arc<Command>> {
        self.list()
            .into_iter()
            .filter(|c| c.command_type == command_type)
            .collect()
    }

    pub fn cancel_command_for(&self, deployment_id: &str) -> Option<Arc<Command>> {
        self.list()
            .into_iter()
            .find(|c| c.is_cancel_for(deployment_id))
    }

    pub fn approval_command_for(
        &self,
        deployment_id: &str,
        stage_id: &str,
    ) -> Option<Arc<Command>> {
        self.list()
            .into_iter()
            .find(|c| c.is_approval_for(deployment_id, stage_id))
    }

    /// Acknowledge the command back to the control plane. The command stops
    /// being listed locally whether or not the report succeeds; the report
    /// is retried by the API client's own policy.
    pub async fn ack(
        &self,
        command: &Command,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        {
            self.handled.lock().insert(command.id.clone());
        }
        self.metrics.commands_handled.inc();
        self.api
            .report_command_handled(ReportCommandHandledRequest {
                command_id: command.id.clone(),
                metadata,
                handled_at: Utc::now(),
            })
            .await
            .map_err(|e| crate::error::Error::Api("report command handled".to_string(), e))
    }
}
