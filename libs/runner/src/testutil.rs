//! In-memory control plane used by the component tests.

use crate::apistore::CommandStore;
use crate::cache::SingleFlightCache;
use crate::controller::{ControllerOptions, SchedulerDeps};
use crate::executor::ExecutorRegistry;
use crate::metrics::Metrics;
use crate::notifier::Notifier;
use crate::planner::PlannerRegistry;
use crate::toolregistry::ToolRegistry;

use piped_api_client::rpc::*;
use piped_api_client::{ApiClient, Result};
use piped_model::*;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub(crate) struct FakeApiClient {
    pub applications: Mutex<Vec<Application>>,
    pub deployments: Mutex<HashMap<String, Deployment>>,
    pub commands: Mutex<Vec<Command>>,
    pub events: Mutex<Vec<Event>>,
    /// Chronological log of (stage id, status) per deployment.
    pub stage_reports: Mutex<Vec<(String, String, StageStatus, String)>>,
    pub deployment_reports: Mutex<Vec<(String, DeploymentStatus)>>,
    pub completed: Mutex<HashMap<String, (DeploymentStatus, String)>>,
    pub stage_metadata: Mutex<HashMap<(String, String), HashMap<String, String>>>,
    pub handled_commands: Mutex<Vec<String>>,
    pub sync_states: Mutex<Vec<(String, SyncState)>>,
    pub logs: Mutex<Vec<LogBlock>>,
}

impl FakeApiClient {
    pub fn stage_status_history(&self, stage_id: &str) -> Vec<StageStatus> {
        self.stage_reports
            .lock()
            .iter()
            .filter(|(_, id, _, _)| id == stage_id)
            .map(|(_, _, status, _)| *status)
            .collect()
    }

    pub fn completed_status(&self, deployment_id: &str) -> Option<(DeploymentStatus, String)> {
        self.completed.lock().get(deployment_id).cloned()
    }
}

#[async_trait]
impl ApiClient for FakeApiClient {
    async fn report_piped_meta(&self, _req: ReportPipedMetaRequest) -> Result<()> {
        Ok(())
    }

    async fn list_applications(&self) -> Result<Vec<Application>> {
        Ok(self.applications.lock().clone())
    }

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>> {
        Ok(self
            .deployments
            .lock()
            .values()
            .filter(|d| !d.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>> {
        let handled = self.handled_commands.lock();
        Ok(self
            .commands
            .lock()
            .iter()
            .filter(|c| !handled.contains(&c.id))
            .cloned()
            .collect())
    }

    async fn list_events(&self) -> Result<Vec<Event>> {
        Ok(self.events.lock().clone())
    }

    async fn get_latest_event(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Option<Event>> {
        let key = piped_model::event::series_key(name, labels);
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| e.event_key() == key)
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    async fn get_environment(&self, id: &str) -> Result<Environment> {
        Ok(Environment {
            id: id.to_string(),
            name: format!("env-{id}"),
            desc: String::new(),
            created_at: None,
        })
    }

    async fn create_deployment(&self, deployment: Deployment) -> Result<()> {
        self.deployments
            .lock()
            .entry(deployment.id.clone())
            .or_insert(deployment);
        Ok(())
    }

    async fn report_deployment_planned(
        &self,
        req: ReportDeploymentPlannedRequest,
    ) -> Result<()> {
        if let Some(d) = self.deployments.lock().get_mut(&req.deployment_id) {
            d.status = DeploymentStatus::Planned;
            d.summary = req.summary;
            d.stages = req.stages;
            d.running_commit_hash = req.running_commit_hash;
        }
        Ok(())
    }

    async fn report_deployment_status_changed(
        &self,
        req: ReportDeploymentStatusChangedRequest,
    ) -> Result<()> {
        self.deployment_reports
            .lock()
            .push((req.deployment_id.clone(), req.status));
        if let Some(d) = self.deployments.lock().get_mut(&req.deployment_id) {
            d.status = req.status;
            d.status_reason = req.status_reason;
        }
        Ok(())
    }

    async fn report_deployment_completed(
        &self,
        req: ReportDeploymentCompletedRequest,
    ) -> Result<()> {
        self.deployment_reports
            .lock()
            .push((req.deployment_id.clone(), req.status));
        self.completed
            .lock()
            .insert(req.deployment_id.clone(), (req.status, req.status_reason.clone()));
        if let Some(d) = self.deployments.lock().get_mut(&req.deployment_id) {
            d.status = req.status;
            d.status_reason = req.status_reason;
            d.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn save_deployment_metadata(&self, _req: SaveDeploymentMetadataRequest) -> Result<()> {
        Ok(())
    }

    async fn report_stage_status_changed(
        &self,
        req: ReportStageStatusChangedRequest,
    ) -> Result<()> {
        self.stage_reports.lock().push((
            req.deployment_id.clone(),
            req.stage_id.clone(),
            req.status,
            req.status_reason.clone(),
        ));
        if let Some(d) = self.deployments.lock().get_mut(&req.deployment_id) {
            if let Some(stage) = d.stage_mut(&req.stage_id) {
                stage.status = req.status;
                stage.status_reason = req.status_reason;
            }
        }
        Ok(())
    }

    async fn save_stage_metadata(&self, req: SaveStageMetadataRequest) -> Result<()> {
        self.stage_metadata
            .lock()
            .insert((req.deployment_id, req.stage_id), req.metadata);
        Ok(())
    }

    async fn report_stage_logs(&self, req: ReportStageLogsRequest) -> Result<()> {
        self.logs.lock().extend(req.blocks);
        Ok(())
    }

    async fn report_command_handled(&self, req: ReportCommandHandledRequest) -> Result<()> {
        self.handled_commands.lock().push(req.command_id);
        Ok(())
    }

    async fn report_application_sync_state(
        &self,
        req: ReportApplicationSyncStateRequest,
    ) -> Result<()> {
        self.sync_states
            .lock()
            .push((req.application_id, req.state));
        Ok(())
    }

    async fn report_application_live_state_events(
        &self,
        _req: ReportApplicationLiveStateEventsRequest,
    ) -> Result<()> {
        Ok(())
    }

    async fn report_piped_stats(&self, _req: ReportPipedStatsRequest) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn application(id: &str, kind: ApplicationKind) -> Application {
    Application {
        id: id.to_string(),
        name: format!("{id}-name"),
        env_id: "env-1".to_string(),
        kind,
        git_path: GitPath {
            repo_id: "main".to_string(),
            path: "app".to_string(),
            config_filename: None,
        },
        cloud_provider: "default".to_string(),
        disabled: false,
        most_recent_successful_commit_hash: None,
        sync_state: None,
        updated_at: None,
    }
}

pub(crate) fn deployment(
    id: &str,
    application: &Application,
    status: DeploymentStatus,
    stages: Vec<Stage>,
) -> Deployment {
    Deployment {
        id: id.to_string(),
        application_id: application.id.clone(),
        application_name: application.name.clone(),
        env_id: application.env_id.clone(),
        piped_id: "piped-1".to_string(),
        kind: application.kind,
        git_path: application.git_path.clone(),
        trigger: DeploymentTrigger {
            commit_hash: "0123456789abcdef".to_string(),
            commit_message: "update app".to_string(),
            commit_author: "dev".to_string(),
            commander: String::new(),
            timestamp: Some(Utc::now()),
        },
        running_commit_hash: String::new(),
        status,
        status_reason: String::new(),
        summary: String::new(),
        stages,
        metadata: HashMap::new(),
        created_at: Utc::now(),
        completed_at: None,
    }
}

/// Scheduler dependencies wired to the fake control plane. The command
/// store is synced once so commands present on the fake are visible.
pub(crate) async fn scheduler_deps(
    api: Arc<FakeApiClient>,
    executors: ExecutorRegistry,
    planners: PlannerRegistry,
) -> Arc<SchedulerDeps> {
    let metrics = Metrics::new();
    let command_store = CommandStore::new(api.clone(), Duration::from_secs(30), metrics.clone());
    command_store.sync_once().await.unwrap();
    let notifier = Notifier::new(Default::default(), metrics.clone());
    let handle = notifier.handle();
    Arc::new(SchedulerDeps {
        api,
        commands: command_store.lister(),
        executors: Arc::new(executors),
        planners: Arc::new(planners),
        metrics,
        notifier: handle,
        manifests_cache: Arc::new(SingleFlightCache::new(Duration::from_secs(600))),
        tools: Arc::new(ToolRegistry::new("/nonexistent")),
        cloud_providers: Vec::new(),
        options: ControllerOptions {
            controller_tick: Duration::from_millis(20),
            executor_tick: Duration::from_millis(10),
            default_stage_timeout: Duration::from_secs(6 * 3600),
            terminal_report_retry: Duration::from_millis(20),
        },
    })
}
