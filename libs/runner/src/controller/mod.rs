//! The deployment controller: watches the deployment store and drives every
//! in-flight deployment of the applications this agent manages.
//!
//! At most one deployment per application is active at any time. The
//! controller keeps a per-application worker draining that application's
//! queue in creation order; deployments of different applications run in
//! parallel and unordered.

pub mod log_persister;
pub mod metadata;
pub mod scheduler;
pub mod signal;

pub use scheduler::{ControllerOptions, DeploymentScheduler, SchedulerDeps};
pub use signal::{stop_signal, StopSignal, StopSignalKind};

use crate::apistore::{ApplicationLister, DeploymentLister};
use crate::deploysource::DeploySource;
use crate::error::Result;
use crate::supervisor::Component;

use piped_api_client::rpc::ReportDeploymentCompletedRequest;
use piped_api_client::ApiClient;
use piped_config::PipedSpec;
use piped_git::GitClient;
use piped_model::{Application, Deployment, DeploymentStatus};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct DeploymentController {
    deps: Arc<SchedulerDeps>,
    applications: ApplicationLister,
    deployments: DeploymentLister,
    git: Arc<GitClient>,
    piped: Arc<PipedSpec>,
    workspace: PathBuf,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Deployments finished locally but still listed by the store until its
    /// next refresh.
    locally_completed: Arc<Mutex<HashSet<String>>>,
}

impl DeploymentController {
    pub fn new(
        deps: Arc<SchedulerDeps>,
        applications: ApplicationLister,
        deployments: DeploymentLister,
        git: Arc<GitClient>,
        piped: Arc<PipedSpec>,
        workspace: PathBuf,
    ) -> Self {
        Self {
            deps,
            applications,
            deployments,
            git,
            piped,
            workspace,
            workers: Mutex::new(HashMap::new()),
            locally_completed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn spawn_workers(&self, shutdown: &CancellationToken) {
        let deployments = self.deployments.list();
        let completed = self.locally_completed.lock().clone();
        let mut apps_with_work: Vec<String> = deployments
            .iter()
            .filter(|d| !d.status.is_terminal())
            .filter(|d| !completed.contains(&d.id))
            .map(|d| d.application_id.clone())
            .collect();
        apps_with_work.sort_unstable();
        apps_with_work.dedup();

        let mut workers = self.workers.lock();
        workers.retain(|_, handle| !handle.is_finished());
        for application_id in apps_with_work {
            if workers.contains_key(&application_id) {
                continue;
            }
            let worker = AppWorker {
                deps: self.deps.clone(),
                applications: self.applications.clone(),
                deployments: self.deployments.clone(),
                git: self.git.clone(),
                piped: self.piped.clone(),
                workspace: self.workspace.clone(),
                application_id: application_id.clone(),
                locally_completed: self.locally_completed.clone(),
            };
            debug!(msg = "starting deployment worker", application = %application_id);
            let scope = shutdown.clone();
            workers.insert(application_id, tokio::spawn(worker.run(scope)));
        }
    }

    fn prune_completed(&self) {
        let listed: HashSet<String> =
            self.deployments.list().iter().map(|d| d.id.clone()).collect();
        self.locally_completed
            .lock()
            .retain(|id| listed.contains(id));
    }
}

#[async_trait]
impl Component for DeploymentController {
    fn name(&self) -> &'static str {
        "deployment-controller"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut tick = tokio::time::interval(self.deps.options.controller_tick);
        let mut changes = self.deployments.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {},
                _ = changes.changed() => {},
            }
            if shutdown.is_cancelled() {
                break;
            }
            self.prune_completed();
            self.spawn_workers(&shutdown);
        }

        // wait for the workers to observe the shutdown and unwind
        let workers: Vec<(String, JoinHandle<()>)> =
            self.workers.lock().drain().collect();
        for (application_id, handle) in workers {
            if let Err(e) = handle.await {
                warn!(msg = "deployment worker panicked", application = %application_id, err = %e);
            }
        }
        Ok(())
    }
}

/// Drains one application's deployment queue, oldest first.
struct AppWorker {
    deps: Arc<SchedulerDeps>,
    applications: ApplicationLister,
    deployments: DeploymentLister,
    git: Arc<GitClient>,
    piped: Arc<PipedSpec>,
    workspace: PathBuf,
    application_id: String,
    locally_completed: Arc<Mutex<HashSet<String>>>,
}

impl AppWorker {
    async fn run(self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let queue: Vec<Arc<Deployment>> = {
                let completed = self.locally_completed.lock().clone();
                self.deployments
                    .list_for_application(&self.application_id)
                    .into_iter()
                    .filter(|d| !d.status.is_terminal())
                    .filter(|d| !completed.contains(&d.id))
                    .collect()
            };
            let deployment = match pick_next(&queue) {
                Some(QueueDecision::Supersede(deployment)) => {
                    self.supersede(&deployment).await;
                    continue;
                }
                Some(QueueDecision::Run(deployment)) => deployment,
                None => return,
            };

            let Some(application) = self.applications.get(&deployment.application_id) else {
                debug!(
                    msg = "application of the deployment is not cached yet",
                    deployment = %deployment.id,
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.deps.options.controller_tick) => continue,
                }
            };

            let status = self.execute(application, (*deployment).clone(), &shutdown).await;
            if status.is_terminal() {
                self.locally_completed.lock().insert(deployment.id.clone());
            } else {
                // could not make progress (planning report failed, agent
                // shutting down, ...); wait before retrying
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.deps.options.controller_tick) => {},
                }
            }
        }
    }

    async fn execute(
        &self,
        application: Arc<Application>,
        deployment: Deployment,
        shutdown: &CancellationToken,
    ) -> DeploymentStatus {
        let deployment_id = deployment.id.clone();
        let (target_source, running_source) = match self.prepare_sources(&deployment).await {
            Ok(sources) => sources,
            Err(crate::error::Error::Config(reason)) => {
                // broken configuration is surfaced on the deployment itself
                warn!(
                    msg = "deploy source has invalid configuration",
                    deployment = %deployment_id,
                    reason = %reason,
                );
                self.complete_with_failure(&deployment_id, &reason).await;
                return DeploymentStatus::Failure;
            }
            Err(e) => {
                warn!(
                    msg = "failed to prepare deploy source",
                    deployment = %deployment_id,
                    err = %e,
                );
                return deployment.status;
            }
        };

        let scheduler = DeploymentScheduler::new(
            self.deps.clone(),
            application,
            deployment,
            target_source,
            running_source,
        );
        let status = scheduler.run(shutdown.clone()).await;
        self.cleanup_workspace(&deployment_id).await;
        status
    }

    async fn prepare_sources(
        &self,
        deployment: &Deployment,
    ) -> Result<(Option<Arc<DeploySource>>, Option<Arc<DeploySource>>)> {
        let repo_config = self
            .piped
            .repository(&deployment.git_path.repo_id)
            .ok_or_else(|| {
                crate::error::Error::Config(format!(
                    "repository {:?} is not configured on this piped",
                    deployment.git_path.repo_id
                ))
            })?;
        let repo = self
            .git
            .repo(&repo_config.repo_id, &repo_config.remote, &repo_config.branch)
            .await;
        repo.sync()
            .await
            .map_err(|e| crate::error::Error::Git("sync repository".to_string(), e))?;

        let base = self.workspace.join("deployments").join(&deployment.id);
        let target = DeploySource::prepare(
            &repo,
            &deployment.git_path,
            &deployment.trigger.commit_hash,
            base.join("target"),
        )
        .await?;

        let running_commit = if !deployment.running_commit_hash.is_empty() {
            Some(deployment.running_commit_hash.clone())
        } else {
            None
        };
        let running = match running_commit {
            Some(commit) => {
                match DeploySource::prepare(&repo, &deployment.git_path, &commit, base.join("running"))
                    .await
                {
                    Ok(source) => Some(Arc::new(source)),
                    Err(e) => {
                        warn!(
                            msg = "failed to prepare running deploy source",
                            deployment = %deployment.id,
                            err = %e,
                        );
                        None
                    }
                }
            }
            None => None,
        };

        Ok((Some(Arc::new(target)), running))
    }

    async fn supersede(&self, deployment: &Deployment) {
        info!(
            msg = "cancelling deployment superseded by a newer one",
            deployment = %deployment.id,
        );
        let request = ReportDeploymentCompletedRequest {
            deployment_id: deployment.id.clone(),
            status: DeploymentStatus::Cancelled,
            status_reason: "superseded by a newer deployment".to_string(),
            stage_statuses: HashMap::new(),
            completed_at: Utc::now(),
        };
        match self.deps.api.report_deployment_completed(request).await {
            Ok(()) => {
                self.locally_completed.lock().insert(deployment.id.clone());
            }
            Err(e) => {
                warn!(msg = "failed to cancel superseded deployment", err = %e);
                tokio::time::sleep(self.deps.options.controller_tick).await;
            }
        }
    }

    async fn complete_with_failure(&self, deployment_id: &str, reason: &str) {
        let request = ReportDeploymentCompletedRequest {
            deployment_id: deployment_id.to_string(),
            status: DeploymentStatus::Failure,
            status_reason: reason.to_string(),
            stage_statuses: HashMap::new(),
            completed_at: Utc::now(),
        };
        match self.deps.api.report_deployment_completed(request).await {
            Ok(()) => {
                self.locally_completed
                    .lock()
                    .insert(deployment_id.to_string());
            }
            Err(e) => {
                warn!(msg = "failed to report deployment failure", err = %e);
            }
        }
    }

    async fn cleanup_workspace(&self, deployment_id: &str) {
        let dir = self.workspace.join("deployments").join(deployment_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(msg = "failed to clean deployment workspace", err = %e);
            }
        }
    }
}

/// What to do with the oldest entry of an application's queue.
enum QueueDecision {
    /// Run it: it is the only one, or it already started.
    Run(Arc<Deployment>),
    /// Cancel it: still pending while a newer deployment queued up behind
    /// it, so it would never converge anything useful.
    Supersede(Arc<Deployment>),
}

/// The queue is ordered by creation time and holds only non-terminal
/// deployments; at most one of them runs at a time.
fn pick_next(queue: &[Arc<Deployment>]) -> Option<QueueDecision> {
    let oldest = queue.first()?.clone();
    if oldest.status == DeploymentStatus::Pending && queue.len() > 1 {
        return Some(QueueDecision::Supersede(oldest));
    }
    Some(QueueDecision::Run(oldest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{application, deployment};
    use piped_model::ApplicationKind;

    fn queued(id: &str, status: DeploymentStatus) -> Arc<Deployment> {
        let app = application("app-1", ApplicationKind::Kubernetes);
        Arc::new(deployment(id, &app, status, Vec::new()))
    }

    #[test]
    fn test_pick_next_runs_single_pending() {
        let queue = vec![queued("d-1", DeploymentStatus::Pending)];
        match pick_next(&queue) {
            Some(QueueDecision::Run(d)) => assert_eq!(d.id, "d-1"),
            _ => panic!("expected the only deployment to run"),
        }
    }

    #[test]
    fn test_pick_next_supersedes_stale_pending() {
        let queue = vec![
            queued("d-1", DeploymentStatus::Pending),
            queued("d-2", DeploymentStatus::Pending),
        ];
        match pick_next(&queue) {
            Some(QueueDecision::Supersede(d)) => assert_eq!(d.id, "d-1"),
            _ => panic!("expected the older pending deployment to be superseded"),
        }
    }

    #[test]
    fn test_pick_next_never_supersedes_started_work() {
        // one per application: the running deployment finishes first even
        // with newer ones queued behind it
        let queue = vec![
            queued("d-1", DeploymentStatus::Running),
            queued("d-2", DeploymentStatus::Pending),
        ];
        match pick_next(&queue) {
            Some(QueueDecision::Run(d)) => assert_eq!(d.id, "d-1"),
            _ => panic!("expected the running deployment to continue"),
        }
    }

    #[test]
    fn test_pick_next_empty_queue() {
        assert!(pick_next(&[]).is_none());
    }
}
