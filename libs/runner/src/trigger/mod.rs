//! Turns new commits into deployment records.
//!
//! The trigger periodically walks the configured repositories and, for each
//! enabled application whose trigger paths changed between the last-seen
//! head and the current head, asks the control plane to create a deployment
//! for the new head. Exactly one create call is made per (application,
//! new-head) observation; a failing repository never blocks the others.

pub mod determiner;

use crate::apistore::{ApplicationLister, CommandLister, DeploymentLister};
use crate::error::Result;
use crate::metrics::{KindLabels, Metrics};
use crate::notifier::{NotificationEvent, NotifierHandle};
use crate::supervisor::Component;

use piped_api_client::ApiClient;
use piped_config::PipedSpec;
use piped_git::{Commit, GitClient, Repo};
use piped_model::{
    Application, Command, CommandType, Deployment, DeploymentStatus, DeploymentTrigger,
};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_TRIGGER_INTERVAL: Duration = Duration::from_secs(60);

pub struct Trigger {
    api: Arc<dyn ApiClient>,
    applications: ApplicationLister,
    deployments: DeploymentLister,
    commands: CommandLister,
    git: Arc<GitClient>,
    piped: Arc<PipedSpec>,
    piped_id: String,
    metrics: Arc<Metrics>,
    notifier: NotifierHandle,
    interval: Duration,
    /// Last commit hash a deployment was requested for, per application.
    last_triggered: Mutex<HashMap<String, String>>,
}

impl Trigger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn ApiClient>,
        applications: ApplicationLister,
        deployments: DeploymentLister,
        commands: CommandLister,
        git: Arc<GitClient>,
        piped: Arc<PipedSpec>,
        metrics: Arc<Metrics>,
        notifier: NotifierHandle,
        interval: Duration,
    ) -> Self {
        let piped_id = piped.piped_id.clone();
        Self {
            api,
            applications,
            deployments,
            commands,
            git,
            piped,
            piped_id,
            metrics,
            notifier,
            interval,
            last_triggered: Mutex::new(HashMap::new()),
        }
    }

    async fn tick(&self) {
        self.handle_sync_commands().await;
        for repo_config in &self.piped.repositories {
            let repo = self
                .git
                .repo(&repo_config.repo_id, &repo_config.remote, &repo_config.branch)
                .await;
            if let Err(e) = self.check_repository(&repo_config.repo_id, &repo).await {
                // one broken repository must not block the others
                warn!(
                    msg = "failed to check repository for new commits",
                    repo = %repo_config.repo_id,
                    err = %e,
                );
            }
        }
    }

    async fn check_repository(&self, repo_id: &str, repo: &Repo) -> Result<()> {
        repo.sync()
            .await
            .map_err(|e| crate::error::Error::Git(format!("sync {repo_id}"), e))?;
        let head = repo
            .head_commit()
            .await
            .map_err(|e| crate::error::Error::Git(format!("head of {repo_id}"), e))?;

        for application in self.applications.list_by_repo(repo_id) {
            if application.disabled {
                continue;
            }
            if let Err(e) = self.check_application(&application, repo, &head).await {
                warn!(
                    msg = "failed to evaluate application trigger",
                    application = %application.id,
                    err = %e,
                );
            }
        }
        Ok(())
    }

    async fn check_application(
        &self,
        application: &Arc<Application>,
        repo: &Repo,
        head: &Commit,
    ) -> Result<()> {
        {
            let last = self.last_triggered.lock();
            if last.get(&application.id) == Some(&head.hash) {
                return Ok(());
            }
        }
        // idempotence against deployments created before a restart
        if self
            .deployments
            .exists_for_commit(&application.id, &head.hash)
        {
            self.remember(&application.id, &head.hash);
            return Ok(());
        }

        let last_seen = application.most_recent_successful_commit_hash.clone();
        let should_trigger = match &last_seen {
            None => true,
            Some(last_seen) if last_seen == &head.hash => false,
            Some(last_seen) => self
                .evaluate_changes(application, repo, last_seen, head)
                .await?,
        };
        if !should_trigger {
            self.remember(&application.id, &head.hash);
            return Ok(());
        }

        self.create_deployment(application, head, "").await?;
        self.remember(&application.id, &head.hash);
        Ok(())
    }

    /// Decide by commit message first, then by the changed trigger paths.
    async fn evaluate_changes(
        &self,
        application: &Arc<Application>,
        repo: &Repo,
        last_seen: &str,
        head: &Commit,
    ) -> Result<bool> {
        let generic = match self.load_generic_spec(application, repo).await {
            Ok(generic) => generic,
            Err(e) => {
                debug!(
                    msg = "application configuration could not be loaded at head",
                    application = %application.id,
                    err = %e,
                );
                // still trigger on app-directory changes with defaults
                piped_config::GenericAppSpec::default()
            }
        };

        if determiner::commit_force(&generic.commit_matcher, &head.message).is_some() {
            return Ok(true);
        }

        let changed = repo
            .changed_files(last_seen, &head.hash)
            .await
            .map_err(|e| crate::error::Error::Git("diff changed files".to_string(), e))?;
        Ok(determiner::touches_application(
            &changed,
            &application.git_path.path,
            &generic.trigger_paths,
        ))
    }

    async fn load_generic_spec(
        &self,
        application: &Arc<Application>,
        repo: &Repo,
    ) -> Result<piped_config::GenericAppSpec> {
        let config_path = format!(
            "{}/{}",
            application.git_path.path.trim_end_matches('/'),
            application.git_path.config_file()
        );
        let raw = repo
            .show_file(&format!("origin/{}", repo.branch()), &config_path)
            .await
            .map_err(|e| crate::error::Error::Git("read application config".to_string(), e))?;
        let config = piped_config::parse(&raw)
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;
        config
            .generic()
            .cloned()
            .ok_or_else(|| crate::error::Error::Config("not an application config".to_string()))
    }

    async fn create_deployment(
        &self,
        application: &Arc<Application>,
        head: &Commit,
        commander: &str,
    ) -> Result<()> {
        let deployment = Deployment {
            id: Uuid::new_v4().to_string(),
            application_id: application.id.clone(),
            application_name: application.name.clone(),
            env_id: application.env_id.clone(),
            piped_id: self.piped_id.clone(),
            kind: application.kind,
            git_path: application.git_path.clone(),
            trigger: DeploymentTrigger {
                commit_hash: head.hash.clone(),
                commit_message: head.message.clone(),
                commit_author: head.author.clone(),
                commander: commander.to_string(),
                timestamp: Some(Utc::now()),
            },
            running_commit_hash: application
                .most_recent_successful_commit_hash
                .clone()
                .unwrap_or_default(),
            status: DeploymentStatus::Pending,
            status_reason: String::new(),
            summary: String::new(),
            stages: Vec::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        };
        info!(
            msg = "triggering deployment",
            application = %application.name,
            commit = %head.hash,
            deployment = %deployment.id,
        );
        let deployment_id = deployment.id.clone();
        self.api
            .create_deployment(deployment)
            .await
            .map_err(|e| crate::error::Error::Api("create deployment".to_string(), e))?;
        self.metrics
            .deployments_triggered
            .get_or_create(&KindLabels {
                kind: application.kind.to_string(),
            })
            .inc();
        self.notifier.publish(NotificationEvent::DeploymentTriggered {
            app_name: application.name.clone(),
            env_id: application.env_id.clone(),
            deployment_id,
            kind: application.kind.to_string(),
        });
        Ok(())
    }

    /// SYNC_APPLICATION commands force a deployment for the current head.
    async fn handle_sync_commands(&self) {
        for command in self.commands.list_by_type(CommandType::SyncApplication) {
            if let Err(e) = self.handle_sync_command(&command).await {
                warn!(
                    msg = "failed to handle sync command",
                    command = %command.id,
                    err = %e,
                );
            }
        }
    }

    async fn handle_sync_command(&self, command: &Command) -> Result<()> {
        let Some(application) = self.applications.get(&command.application_id) else {
            debug!(
                msg = "sync command for an unknown application",
                command = %command.id,
            );
            return Ok(());
        };
        let Some(repo_config) = self.piped.repository(&application.git_path.repo_id) else {
            return Err(crate::error::Error::Config(format!(
                "repository {:?} is not configured",
                application.git_path.repo_id
            )));
        };
        let repo = self
            .git
            .repo(&repo_config.repo_id, &repo_config.remote, &repo_config.branch)
            .await;
        repo.sync()
            .await
            .map_err(|e| crate::error::Error::Git("sync repository".to_string(), e))?;
        let head = repo
            .head_commit()
            .await
            .map_err(|e| crate::error::Error::Git("head commit".to_string(), e))?;

        if !self
            .deployments
            .exists_for_commit(&application.id, &head.hash)
        {
            self.create_deployment(&application, &head, &command.commander)
                .await?;
        }
        self.remember(&application.id, &head.hash);
        self.commands.ack(command, HashMap::new()).await?;
        Ok(())
    }

    fn remember(&self, application_id: &str, commit_hash: &str) {
        self.last_triggered
            .lock()
            .insert(application_id.to_string(), commit_hash.to_string());
    }
}

#[async_trait]
impl Component for Trigger {
    fn name(&self) -> &'static str {
        "trigger"
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
