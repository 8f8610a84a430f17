//! Per-deployment execution: drives one deployment through its stage DAG
//! while honoring cancellation, approval and analysis gates.

use super::log_persister::StageLogPersister;
use super::metadata::MetadataStore;
use super::signal::{stop_signal, StopSignalKind};
use crate::apistore::CommandLister;
use crate::cache::AppManifestsCache;
use crate::deploysource::DeploySource;
use crate::error::{Error, Result};
use crate::executor::{ExecutorInput, ExecutorRegistry, StageOutcome};
use crate::metrics::{DeploymentLabels, Metrics, PlanLabels, StageLabels};
use crate::notifier::{NotificationEvent, NotifierHandle};
use crate::planner::{stage_options_for, stage_timeout_for, PlanInput, PlannerRegistry};
use crate::toolregistry::ToolRegistry;

use piped_api_client::rpc::{
    ReportDeploymentCompletedRequest, ReportDeploymentPlannedRequest,
    ReportDeploymentStatusChangedRequest, ReportStageStatusChangedRequest,
};
use piped_api_client::ApiClient;
use piped_config::piped::CloudProvider;
use piped_model::{
    Application, Command, Deployment, DeploymentStatus, StageName, StageStatus,
};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct ControllerOptions {
    /// How often the controller scans for new work.
    pub controller_tick: Duration,
    /// Re-invocation interval for executors that return `Exited`.
    pub executor_tick: Duration,
    pub default_stage_timeout: Duration,
    /// Interval between attempts to report a terminal state that failed to
    /// persist.
    pub terminal_report_retry: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            controller_tick: Duration::from_secs(10),
            executor_tick: Duration::from_secs(10),
            default_stage_timeout: Duration::from_secs(6 * 3600),
            terminal_report_retry: Duration::from_secs(30),
        }
    }
}

/// Dependencies shared by every deployment scheduler.
pub struct SchedulerDeps {
    pub api: Arc<dyn ApiClient>,
    pub commands: CommandLister,
    pub executors: Arc<ExecutorRegistry>,
    pub planners: Arc<PlannerRegistry>,
    pub metrics: Arc<Metrics>,
    pub notifier: NotifierHandle,
    pub manifests_cache: Arc<AppManifestsCache>,
    pub tools: Arc<ToolRegistry>,
    pub cloud_providers: Vec<CloudProvider>,
    pub options: ControllerOptions,
}

/// Owns one in-progress deployment for the duration of its execution.
pub struct DeploymentScheduler {
    deps: Arc<SchedulerDeps>,
    application: Arc<Application>,
    deployment: Deployment,
    target_source: Option<Arc<DeploySource>>,
    running_source: Option<Arc<DeploySource>>,
    metadata: MetadataStore,
    pending_cancel: Option<Arc<Command>>,
}

impl DeploymentScheduler {
    pub fn new(
        deps: Arc<SchedulerDeps>,
        application: Arc<Application>,
        deployment: Deployment,
        target_source: Option<Arc<DeploySource>>,
        running_source: Option<Arc<DeploySource>>,
    ) -> Self {
        let metadata = MetadataStore::new(deps.api.clone(), deployment.id.clone());
        metadata.seed(&deployment.metadata);
        Self {
            deps,
            application,
            deployment,
            target_source,
            running_source,
            metadata,
            pending_cancel: None,
        }
    }

    /// Drive the deployment to a terminal state, or return early on agent
    /// shutdown. Returns the last observed status.
    pub async fn run(mut self, shutdown: CancellationToken) -> DeploymentStatus {
        if self.deployment.status == DeploymentStatus::Pending {
            match self.plan(&shutdown).await {
                Ok(true) => {}
                Ok(false) => return self.deployment.status,
                Err(e) => {
                    warn!(
                        msg = "planning could not be persisted, will retry",
                        deployment = %self.deployment.id,
                        err = %e,
                    );
                    return self.deployment.status;
                }
            }
        }

        if self.deployment.status.is_terminal() {
            return self.deployment.status;
        }

        self.report_deployment_status(DeploymentStatus::Running, "")
            .await;

        let auto_rollback = self
            .target_source
            .as_ref()
            .map(|s| s.generic().auto_rollback)
            .unwrap_or(true);
        let deployment_deadline = self.deployment.created_at
            + chrono::Duration::from_std(
                self.target_source
                    .as_ref()
                    .map(|s| s.generic().deployment_timeout())
                    .unwrap_or(piped_config::DEFAULT_DEPLOYMENT_TIMEOUT),
            )
            .unwrap_or_else(|_| chrono::Duration::hours(6));

        let final_status = loop {
            if shutdown.is_cancelled() {
                return self.deployment.status;
            }
            let Some(stage_id) = self.next_stage_id() else {
                break (DeploymentStatus::Success, String::new());
            };

            let (outcome, signal) = self
                .execute_stage(&stage_id, &shutdown, deployment_deadline)
                .await;

            match outcome {
                StageOutcome::Success | StageOutcome::Skipped(_) => continue,
                StageOutcome::Failure(reason) => {
                    if auto_rollback {
                        self.run_rollback(&shutdown, deployment_deadline).await;
                    }
                    break (DeploymentStatus::Failure, reason);
                }
                StageOutcome::Cancelled(_) => {
                    let kind = signal.unwrap_or(StopSignalKind::Cancel);
                    if kind == StopSignalKind::Shutdown {
                        // leave the deployment for the next process to resume
                        return self.deployment.status;
                    }
                    self.ack_pending_cancel().await;
                    if kind.wants_rollback(auto_rollback) {
                        self.run_rollback(&shutdown, deployment_deadline).await;
                        break (DeploymentStatus::Failure, "cancelled".to_string());
                    }
                    break (DeploymentStatus::Cancelled, "cancelled".to_string());
                }
                StageOutcome::Exited => {
                    // the tick loop only returns Exited on shutdown
                    return self.deployment.status;
                }
            }
        };

        let (status, reason) = final_status;
        self.report_completed(status, &reason, &shutdown).await;
        status
    }

    /// The stage to run next: a stage still marked RUNNING (resumed after a
    /// restart) or the first eligible not-started one. The prepared
    /// rollback stage is never picked here.
    fn next_stage_id(&self) -> Option<String> {
        if let Some(running) = self
            .deployment
            .stages
            .iter()
            .filter(|s| s.name != StageName::Rollback)
            .find(|s| s.status == StageStatus::Running)
        {
            return Some(running.id.clone());
        }
        self.deployment
            .eligible_stages()
            .into_iter()
            .filter(|s| s.name != StageName::Rollback)
            .min_by_key(|s| s.index)
            .map(|s| s.id.clone())
    }

    async fn plan(&mut self, shutdown: &CancellationToken) -> Result<bool> {
        let Some(target) = self.target_source.clone() else {
            self.fail_planning("deploy source is not available", shutdown)
                .await;
            return Ok(false);
        };
        let planner = match self.deps.planners.get(self.deployment.kind) {
            Ok(p) => p,
            Err(e) => {
                self.fail_planning(&e.to_string(), shutdown).await;
                return Ok(false);
            }
        };
        let input = PlanInput {
            deployment: Arc::new(self.deployment.clone()),
            target,
            running: self.running_source.clone(),
            last_successful_commit: self
                .application
                .most_recent_successful_commit_hash
                .clone(),
        };
        let plan = match planner.plan(&input).await {
            Ok(plan) => plan,
            Err(e) => {
                self.fail_planning(&format!("failed to plan the deployment: {e}"), shutdown)
                    .await;
                return Ok(false);
            }
        };

        info!(
            msg = "deployment was planned",
            deployment = %self.deployment.id,
            strategy = plan.strategy.as_str(),
            summary = %plan.summary,
        );
        self.deps
            .metrics
            .plans_decided
            .get_or_create(&PlanLabels {
                kind: self.deployment.kind.to_string(),
                strategy: plan.strategy.as_str().to_string(),
            })
            .inc();

        let running_commit_hash = self
            .application
            .most_recent_successful_commit_hash
            .clone()
            .unwrap_or_default();
        self.deps
            .api
            .report_deployment_planned(ReportDeploymentPlannedRequest {
                deployment_id: self.deployment.id.clone(),
                summary: plan.summary.clone(),
                status_reason: String::new(),
                stages: plan.stages.clone(),
                running_commit_hash: running_commit_hash.clone(),
            })
            .await
            .map_err(|e| Error::Api("report deployment planned".to_string(), e))?;

        self.deployment.summary = plan.summary.clone();
        self.deployment.stages = plan.stages;
        self.deployment.running_commit_hash = running_commit_hash;
        self.deployment.status = DeploymentStatus::Planned;
        self.deps.notifier.publish(NotificationEvent::DeploymentPlanned {
            app_name: self.application.name.clone(),
            env_id: self.application.env_id.clone(),
            deployment_id: self.deployment.id.clone(),
            summary: plan.summary,
        });
        Ok(true)
    }

    async fn fail_planning(&mut self, reason: &str, shutdown: &CancellationToken) {
        warn!(
            msg = "deployment cannot be planned",
            deployment = %self.deployment.id,
            reason = %reason,
        );
        self.report_completed(DeploymentStatus::Failure, reason, shutdown)
            .await;
    }

    async fn execute_stage(
        &mut self,
        stage_id: &str,
        shutdown: &CancellationToken,
        deployment_deadline: DateTime<Utc>,
    ) -> (StageOutcome, Option<StopSignalKind>) {
        let stage = self
            .deployment
            .stage(stage_id)
            .cloned()
            .expect("scheduled stage exists");
        let resumed = stage.status == StageStatus::Running;

        let Some(executor) = self
            .deps
            .executors
            .resolve(self.deployment.kind, stage.name)
        else {
            let reason = "unsupported stage".to_string();
            self.report_stage_status(stage_id, StageStatus::Failure, &reason)
                .await;
            return (StageOutcome::Failure(reason), None);
        };

        let retried_count = if resumed {
            stage.retried_count + 1
        } else {
            stage.retried_count
        };
        if let Some(local) = self.deployment.stage_mut(stage_id) {
            local.retried_count = retried_count;
        }
        self.report_stage_status(stage_id, StageStatus::Running, "")
            .await;
        self.deps.notifier.publish(NotificationEvent::StageStarted {
            app_name: self.application.name.clone(),
            env_id: self.application.env_id.clone(),
            deployment_id: self.deployment.id.clone(),
            stage_name: stage.name.to_string(),
        });

        let generic = self.target_source.as_ref().map(|s| s.generic());
        let stage_options = generic.and_then(|g| stage_options_for(g, &stage));
        let stage_timeout = generic
            .and_then(|g| stage_timeout_for(g, &stage))
            .unwrap_or(self.deps.options.default_stage_timeout);

        let log = StageLogPersister::new(
            self.deps.api.clone(),
            self.deployment.id.clone(),
            stage_id.to_string(),
            retried_count,
        );
        let cloud_provider = self
            .deps
            .cloud_providers
            .iter()
            .find(|p| p.name == self.application.cloud_provider)
            .cloned();

        let started_at = Utc::now();
        let stage_deadline = started_at
            + chrono::Duration::from_std(stage_timeout)
                .unwrap_or_else(|_| chrono::Duration::hours(6));
        let input = ExecutorInput {
            application: self.application.clone(),
            deployment: Arc::new(self.deployment.clone()),
            stage: stage.clone(),
            stage_options,
            stage_started_at: started_at,
            target_source: self.target_source.clone(),
            running_source: self.running_source.clone(),
            cloud_provider,
            commands: self.deps.commands.clone(),
            log: log.clone(),
            metadata: self.metadata.clone(),
            manifests_cache: self.deps.manifests_cache.clone(),
            tools: self.deps.tools.clone(),
        };

        let (stop_sender, signal) = stop_signal();
        let outcome = loop {
            if shutdown.is_cancelled() {
                stop_sender.signal(StopSignalKind::Shutdown);
            } else if let Some(command) = self.deps.commands.cancel_command_for(&self.deployment.id)
            {
                let kind = if command.force_rollback {
                    StopSignalKind::CancelWithRollback
                } else if command.force_no_rollback {
                    StopSignalKind::CancelWithoutRollback
                } else {
                    StopSignalKind::Cancel
                };
                self.pending_cancel = Some(command);
                stop_sender.signal(kind);
            } else if Utc::now() > stage_deadline || Utc::now() > deployment_deadline {
                stop_sender.signal(StopSignalKind::Timeout);
            }

            let outcome = executor.execute(&input, signal.clone()).await;
            log.flush().await;
            match outcome {
                StageOutcome::Exited => {
                    if shutdown.is_cancelled() {
                        break StageOutcome::Exited;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => {},
                        _ = tokio::time::sleep(self.deps.options.executor_tick) => {},
                    }
                }
                other => break other,
            }
        };

        let signal_kind = signal.signaled();
        // a stage killed by its deadline is a failure, not a cancellation
        let outcome = match (outcome, signal_kind) {
            (StageOutcome::Cancelled(_), Some(StopSignalKind::Timeout)) => {
                StageOutcome::Failure("stage timed out".to_string())
            }
            (outcome, _) => outcome,
        };

        let (status, reason) = match &outcome {
            StageOutcome::Success => (StageStatus::Success, String::new()),
            StageOutcome::Failure(reason) => (StageStatus::Failure, reason.clone()),
            StageOutcome::Cancelled(_) => {
                let reason = if signal_kind == Some(StopSignalKind::Shutdown) {
                    "agent shutdown".to_string()
                } else {
                    "cancelled".to_string()
                };
                (StageStatus::Cancelled, reason)
            }
            StageOutcome::Skipped(reason) => (StageStatus::Skipped, reason.clone()),
            StageOutcome::Exited => (StageStatus::Cancelled, "agent shutdown".to_string()),
        };
        self.report_stage_status(stage_id, status, &reason).await;
        log.flush().await;

        let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
        let labels = StageLabels {
            stage: stage.name.to_string(),
            status: format!("{status:?}").to_uppercase(),
        };
        self.deps
            .metrics
            .stages_completed
            .get_or_create(&labels)
            .inc();
        self.deps
            .metrics
            .stage_duration_seconds
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
        self.deps.notifier.publish(NotificationEvent::StageCompleted {
            app_name: self.application.name.clone(),
            env_id: self.application.env_id.clone(),
            deployment_id: self.deployment.id.clone(),
            stage_name: stage.name.to_string(),
            status,
        });

        let outcome = if matches!(outcome, StageOutcome::Exited) {
            StageOutcome::Cancelled("agent shutdown".to_string())
        } else {
            outcome
        };
        (outcome, signal_kind)
    }

    async fn run_rollback(
        &mut self,
        shutdown: &CancellationToken,
        deployment_deadline: DateTime<Utc>,
    ) {
        let Some(rollback) = self.deployment.rollback_stage() else {
            return;
        };
        if rollback.status.is_terminal() {
            return;
        }
        let stage_id = rollback.id.clone();
        info!(
            msg = "running rollback stage",
            deployment = %self.deployment.id,
        );
        self.report_deployment_status(DeploymentStatus::RollingBack, "")
            .await;
        let _ = self
            .execute_stage(&stage_id, shutdown, deployment_deadline)
            .await;
    }

    async fn ack_pending_cancel(&mut self) {
        if let Some(command) = self.pending_cancel.take() {
            if let Err(e) = self.deps.commands.ack(&command, HashMap::new()).await {
                warn!(msg = "failed to acknowledge cancel command", err = %e);
            }
        }
    }

    /// Update the local copy and report, keeping transitions monotonic:
    /// a terminal local state is never overwritten.
    async fn report_stage_status(&mut self, stage_id: &str, status: StageStatus, reason: &str) {
        let (retried_count, completed_at) = {
            let Some(stage) = self.deployment.stage_mut(stage_id) else {
                return;
            };
            if !stage.status.can_transition_to(status) {
                warn!(
                    msg = "refusing non-monotonic stage transition",
                    stage = stage_id,
                    from = ?stage.status,
                    to = ?status,
                );
                return;
            }
            stage.status = status;
            stage.status_reason = reason.to_string();
            if status.is_terminal() {
                stage.completed_at = Some(Utc::now());
            }
            (stage.retried_count, stage.completed_at)
        };
        let request = ReportStageStatusChangedRequest {
            deployment_id: self.deployment.id.clone(),
            stage_id: stage_id.to_string(),
            status,
            status_reason: reason.to_string(),
            retried_count,
            completed_at,
        };
        if let Err(e) = self.deps.api.report_stage_status_changed(request).await {
            warn!(
                msg = "failed to report stage status, the terminal report will correct it",
                deployment = %self.deployment.id,
                stage = stage_id,
                err = %e,
            );
        }
    }

    async fn report_deployment_status(&mut self, status: DeploymentStatus, reason: &str) {
        self.deployment.status = status;
        self.deployment.status_reason = reason.to_string();
        let request = ReportDeploymentStatusChangedRequest {
            deployment_id: self.deployment.id.clone(),
            status,
            status_reason: reason.to_string(),
        };
        if let Err(e) = self.deps.api.report_deployment_status_changed(request).await {
            warn!(
                msg = "failed to report deployment status",
                deployment = %self.deployment.id,
                err = %e,
            );
        }
    }

    /// Persist the terminal state. Retried until it succeeds so a reporter
    /// outage cannot lose the outcome; gives up only on shutdown.
    async fn report_completed(
        &mut self,
        status: DeploymentStatus,
        reason: &str,
        shutdown: &CancellationToken,
    ) {
        self.deployment.status = status;
        self.deployment.status_reason = reason.to_string();
        let stage_statuses: HashMap<String, StageStatus> = self
            .deployment
            .stages
            .iter()
            .map(|s| (s.id.clone(), s.status))
            .collect();
        let request = ReportDeploymentCompletedRequest {
            deployment_id: self.deployment.id.clone(),
            status,
            status_reason: reason.to_string(),
            stage_statuses,
            completed_at: Utc::now(),
        };
        loop {
            match self
                .deps
                .api
                .report_deployment_completed(request.clone())
                .await
            {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        msg = "failed to report deployment completion, retrying",
                        deployment = %self.deployment.id,
                        err = %e,
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.deps.options.terminal_report_retry) => {},
                    }
                }
            }
        }

        self.deps
            .metrics
            .deployments_completed
            .get_or_create(&DeploymentLabels {
                kind: self.deployment.kind.to_string(),
                status: format!("{status:?}").to_uppercase(),
            })
            .inc();
        let event = match status {
            DeploymentStatus::Success => NotificationEvent::DeploymentSucceeded {
                app_name: self.application.name.clone(),
                env_id: self.application.env_id.clone(),
                deployment_id: self.deployment.id.clone(),
            },
            DeploymentStatus::Cancelled => NotificationEvent::DeploymentCancelled {
                app_name: self.application.name.clone(),
                env_id: self.application.env_id.clone(),
                deployment_id: self.deployment.id.clone(),
            },
            _ => NotificationEvent::DeploymentFailed {
                app_name: self.application.name.clone(),
                env_id: self.application.env_id.clone(),
                deployment_id: self.deployment.id.clone(),
                reason: reason.to_string(),
            },
        };
        self.deps.notifier.publish(event);
        info!(
            msg = "deployment completed",
            deployment = %self.deployment.id,
            status = ?status,
            reason = %reason,
        );
    }
}
