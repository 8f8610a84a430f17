//! Continuous reconciliation of live state against desired Git state.
//!
//! Every minute each application is judged and a sync state derived:
//! deploying beats everything, then invalid configuration, then the
//! provider's live-vs-desired verdict. States are reported only when the
//! observation changes (level-triggered edge suppression).

use crate::apistore::{ApplicationLister, DeploymentLister};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::notifier::{NotificationEvent, NotifierHandle};
use crate::supervisor::Component;

use piped_api_client::rpc::ReportApplicationSyncStateRequest;
use piped_api_client::ApiClient;
use piped_config::PipedSpec;
use piped_git::GitClient;
use piped_model::{Application, ApplicationKind, SyncState, SyncStatus};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_DRIFT_INTERVAL: Duration = Duration::from_secs(60);

/// Judges one application kind. The provider loads the desired manifests
/// from the given head checkout and compares them with its live snapshot.
#[async_trait]
pub trait DriftProvider: Send + Sync {
    async fn detect(&self, application: &Application, repo_dir: &Path) -> SyncState;
}

#[derive(Default)]
pub struct DriftProviderRegistry {
    providers: HashMap<ApplicationKind, Arc<dyn DriftProvider>>,
}

impl DriftProviderRegistry {
    pub fn register(&mut self, kind: ApplicationKind, provider: Arc<dyn DriftProvider>) {
        self.providers.insert(kind, provider);
    }

    pub fn get(&self, kind: ApplicationKind) -> Option<Arc<dyn DriftProvider>> {
        self.providers.get(&kind).cloned()
    }
}

pub struct DriftDetector {
    api: Arc<dyn ApiClient>,
    applications: ApplicationLister,
    deployments: DeploymentLister,
    providers: Arc<DriftProviderRegistry>,
    git: Arc<GitClient>,
    piped: Arc<PipedSpec>,
    metrics: Arc<Metrics>,
    notifier: NotifierHandle,
    interval: Duration,
    last_reported: Mutex<HashMap<String, SyncState>>,
}

impl DriftDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn ApiClient>,
        applications: ApplicationLister,
        deployments: DeploymentLister,
        providers: Arc<DriftProviderRegistry>,
        git: Arc<GitClient>,
        piped: Arc<PipedSpec>,
        metrics: Arc<Metrics>,
        notifier: NotifierHandle,
        interval: Duration,
    ) -> Self {
        Self {
            api,
            applications,
            deployments,
            providers,
            git,
            piped,
            metrics,
            notifier,
            interval,
            last_reported: Mutex::new(HashMap::new()),
        }
    }

    async fn tick(&self) {
        // bring every repository's head checkout up to date once per tick
        let mut repo_dirs: HashMap<String, std::path::PathBuf> = HashMap::new();
        for repo_config in &self.piped.repositories {
            let repo = self
                .git
                .repo(&repo_config.repo_id, &repo_config.remote, &repo_config.branch)
                .await;
            let synced = match repo.sync().await {
                Ok(()) => repo.checkout_head().await,
                Err(e) => Err(e),
            };
            match synced {
                Ok(()) => {
                    repo_dirs.insert(repo_config.repo_id.clone(), repo.dir().to_path_buf());
                }
                Err(e) => {
                    warn!(msg = "failed to refresh repository head", repo = %repo_config.repo_id, err = %e);
                }
            }
        }

        let mut out_of_sync = 0i64;
        for application in self.applications.list() {
            if application.disabled {
                continue;
            }
            let Some(repo_dir) = repo_dirs.get(&application.git_path.repo_id) else {
                continue;
            };
            let state = self.judge(&application, repo_dir).await;
            if state.status == SyncStatus::OutOfSync {
                out_of_sync += 1;
            }
            self.report_if_changed(&application, state).await;
        }
        self.metrics.applications_out_of_sync.set(out_of_sync);
    }

    /// Precedence: deploying > provider verdict > unknown kind.
    async fn judge(&self, application: &Application, repo_dir: &Path) -> SyncState {
        if let Some(deployment) = self.deployments.active_for_application(&application.id) {
            let mut state = SyncState::new(SyncStatus::Deploying);
            state.head_deployment_id = deployment.id.clone();
            return state;
        }
        match self.providers.get(application.kind) {
            Some(provider) => provider.detect(application, repo_dir).await,
            None => SyncState::new(SyncStatus::Unknown),
        }
    }

    async fn report_if_changed(&self, application: &Application, state: SyncState) {
        {
            let last = self.last_reported.lock();
            if let Some(previous) = last.get(&application.id) {
                if previous.same_observation(&state) {
                    return;
                }
            }
        }
        debug!(
            msg = "application sync state changed",
            application = %application.name,
            status = ?state.status,
        );
        if state.status == SyncStatus::OutOfSync {
            self.notifier.publish(NotificationEvent::ApplicationOutOfSync {
                app_name: application.name.clone(),
                env_id: application.env_id.clone(),
                application_id: application.id.clone(),
                reason: state.short_reason.clone(),
            });
        }
        let request = ReportApplicationSyncStateRequest {
            application_id: application.id.clone(),
            state: state.clone(),
        };
        match self.api.report_application_sync_state(request).await {
            Ok(()) => {
                self.last_reported
                    .lock()
                    .insert(application.id.clone(), state);
            }
            Err(e) => {
                // keep the old observation so the next tick retries
                warn!(
                    msg = "failed to report sync state",
                    application = %application.id,
                    err = %e,
                );
            }
        }
    }
}

#[async_trait]
impl Component for DriftDetector {
    fn name(&self) -> &'static str {
        "drift-detector"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tick.tick() => self.tick().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_observation_suppresses() {
        let a = SyncState::new(SyncStatus::Synced);
        let mut b = SyncState::new(SyncStatus::Synced);
        b.timestamp = a.timestamp + chrono::Duration::seconds(90);
        assert!(a.same_observation(&b));

        let c = SyncState::new(SyncStatus::OutOfSync)
            .with_reason("Deployment web differs", "spec/replicas changed");
        assert!(!a.same_observation(&c));
    }
}
