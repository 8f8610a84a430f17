//! The Kubernetes planner: quick sync or progressive pipeline, decided by
//! diffing the old and new manifest sets.

use crate::diff::{image_changes, workload_diff, REPLICAS_PATH, TEMPLATE_PATH};
use crate::loader::Loader;

use piped_config::Config;
use piped_model::{Manifest, StageName};
use piped_runner::error::{Error, Result};
use piped_runner::planner::{
    pipeline_stages, quick_sync_stages, Plan, PlanInput, Planner, SyncStrategy,
    ROLLBACK_COMMIT_MARKER,
};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct KubernetesPlanner {
    loader: Arc<Loader>,
}

impl KubernetesPlanner {
    pub fn new(loader: Arc<Loader>) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl Planner for KubernetesPlanner {
    async fn plan(&self, input: &PlanInput) -> Result<Plan> {
        let target = &input.target;
        let Config::KubernetesApp(spec) = &target.config else {
            return Err(Error::Config(
                "expected a KubernetesApp configuration".to_string(),
            ));
        };
        let config_filename = input.deployment.git_path.config_file();

        // without a configured pipeline there is nothing progressive to run
        if !spec.generic.has_pipeline() {
            return Ok(self.quick_sync(
                spec,
                "Quick sync by applying all manifests (no pipeline was configured)",
            ));
        }

        let Some(last_successful) = input.last_successful_commit.as_deref() else {
            return Ok(self.quick_sync(
                spec,
                "Quick sync, because it was unable to find the most recent successful commit",
            ));
        };

        if input
            .deployment
            .trigger
            .commit_message
            .contains(ROLLBACK_COMMIT_MARKER)
        {
            return Ok(self.quick_sync(
                spec,
                &format!("Quick sync to rollback from commit {last_successful}"),
            ));
        }

        let new_manifests = self
            .loader
            .load(&target.app_dir, spec, config_filename)
            .await?;
        let old_manifests = match &input.running {
            Some(running) => {
                let Config::KubernetesApp(running_spec) = &running.config else {
                    return Err(Error::Config(
                        "running commit holds a non-Kubernetes configuration".to_string(),
                    ));
                };
                self.loader
                    .load(&running.app_dir, running_spec, config_filename)
                    .await?
            }
            None => {
                debug!(
                    msg = "running deploy source is unavailable, falling back to quick sync",
                    deployment = %input.deployment.id,
                );
                return Ok(self.quick_sync(spec, "Quick sync by applying all manifests"));
            }
        };

        let (strategy, summary) = decide(&old_manifests, &new_manifests);
        match strategy {
            SyncStrategy::QuickSync => Ok(self.quick_sync(spec, &summary)),
            SyncStrategy::Pipeline => {
                let stages = pipeline_stages(
                    spec.generic.pipeline.as_ref().expect("pipeline exists"),
                    spec.generic.auto_rollback,
                );
                Ok(Plan {
                    strategy,
                    summary,
                    stages,
                })
            }
        }
    }
}

impl KubernetesPlanner {
    fn quick_sync(&self, spec: &piped_config::KubernetesAppSpec, summary: &str) -> Plan {
        Plan {
            strategy: SyncStrategy::QuickSync,
            summary: summary.to_string(),
            stages: quick_sync_stages(StageName::K8sSync, summary, spec.generic.auto_rollback),
        }
    }
}

/// Pure decision over the manifest sets. The first matching rule wins:
/// a changed workload template means a progressive pipeline; a pure scale
/// change or anything else means a quick sync.
pub fn decide(old: &[Manifest], new: &[Manifest]) -> (SyncStrategy, String) {
    let Some(wdiff) = workload_diff(old, new) else {
        return (
            SyncStrategy::QuickSync,
            "Quick sync by applying all manifests".to_string(),
        );
    };

    let template_changes = wdiff.scoped(TEMPLATE_PATH);
    if !template_changes.is_empty() {
        let images = image_changes(&wdiff);
        let summary = if images.is_empty() {
            "Sync progressively because some fields in the workload template were changed"
                .to_string()
        } else {
            let changes: Vec<String> = images
                .iter()
                .map(|c| format!("image {} from {} to {}", c.name, c.before_tag, c.after_tag))
                .collect();
            format!(
                "Sync progressively because of updating {}",
                changes.join(", ")
            )
        };
        return (SyncStrategy::Pipeline, summary);
    }

    let replica_changes = wdiff.scoped(REPLICAS_PATH);
    if !replica_changes.is_empty() && wdiff.only_within(&[REPLICAS_PATH]) {
        let entry = &replica_changes.entries[0];
        let before = entry
            .before
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();
        let after = entry
            .after
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();
        return (
            SyncStrategy::QuickSync,
            format!("Scale workload from {before} to {after}."),
        );
    }

    (
        SyncStrategy::QuickSync,
        "Quick sync by applying all manifests".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Loader;
    use piped_model::{ApplicationKind, DeploymentStatus};
    use piped_runner::deploysource::DeploySource;
    use piped_runner::toolregistry::ToolRegistry;

    fn workload(image: &str, replicas: u32) -> Manifest {
        Manifest::from_yaml_multi(&format!(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: {replicas}
  template:
    spec:
      containers:
        - name: app
          image: {image}
"#
        ))
        .unwrap()
        .remove(0)
    }

    #[test]
    fn test_decide_image_change_is_progressive() {
        let (strategy, summary) = decide(&[workload("app:1.2", 3)], &[workload("app:1.3", 3)]);
        assert_eq!(strategy, SyncStrategy::Pipeline);
        assert!(summary.contains("image app from 1.2 to 1.3"), "{summary}");
    }

    #[test]
    fn test_decide_scale_only_is_quick_sync() {
        let (strategy, summary) = decide(&[workload("app:1.2", 3)], &[workload("app:1.2", 5)]);
        assert_eq!(strategy, SyncStrategy::QuickSync);
        assert_eq!(summary, "Scale workload from 3 to 5.");
    }

    #[test]
    fn test_decide_no_change_is_quick_sync() {
        let (strategy, summary) = decide(&[workload("app:1.2", 3)], &[workload("app:1.2", 3)]);
        assert_eq!(strategy, SyncStrategy::QuickSync);
        assert_eq!(summary, "Quick sync by applying all manifests");
    }

    #[test]
    fn test_decide_is_pure() {
        let old = [workload("app:1.2", 3)];
        let new = [workload("app:1.3", 3)];
        let first = decide(&old, &new);
        let second = decide(&old, &new);
        assert_eq!(first, second);
    }

    const APP_CONFIG: &str = r#"
apiVersion: piped.dev/v1beta1
kind: KubernetesApp
spec:
  pipeline:
    stages:
      - name: K8S_CANARY_ROLLOUT
        with:
          replicas: 50%
      - name: K8S_PRIMARY_ROLLOUT
      - name: K8S_CANARY_CLEAN
"#;

    fn source(dir: &std::path::Path, commit: &str) -> Arc<DeploySource> {
        std::fs::create_dir_all(dir.join("app")).unwrap();
        std::fs::write(dir.join("app/.piped.yaml"), APP_CONFIG).unwrap();
        std::fs::write(
            dir.join("app/deployment.yaml"),
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 3
  template:
    spec:
      containers:
        - name: app
          image: app:1.3
"#,
        )
        .unwrap();
        let git_path = piped_model::GitPath {
            repo_id: "main".to_string(),
            path: "app".to_string(),
            config_filename: None,
        };
        Arc::new(DeploySource::from_dir(dir, &git_path, commit).unwrap())
    }

    fn plan_input(target: Arc<DeploySource>, last_successful: Option<&str>) -> PlanInput {
        let application = piped_model::Application {
            id: "app-1".to_string(),
            name: "web".to_string(),
            env_id: "env-1".to_string(),
            kind: ApplicationKind::Kubernetes,
            git_path: piped_model::GitPath {
                repo_id: "main".to_string(),
                path: "app".to_string(),
                config_filename: None,
            },
            cloud_provider: "default".to_string(),
            disabled: false,
            most_recent_successful_commit_hash: last_successful.map(str::to_string),
            sync_state: None,
            updated_at: None,
        };
        let mut deployment = piped_model::Deployment {
            id: "d-1".to_string(),
            application_id: application.id.clone(),
            application_name: application.name.clone(),
            env_id: application.env_id.clone(),
            piped_id: "piped-1".to_string(),
            kind: ApplicationKind::Kubernetes,
            git_path: application.git_path.clone(),
            trigger: Default::default(),
            running_commit_hash: String::new(),
            status: DeploymentStatus::Pending,
            status_reason: String::new(),
            summary: String::new(),
            stages: Vec::new(),
            metadata: Default::default(),
            created_at: chrono::Utc::now(),
            completed_at: None,
        };
        deployment.trigger.commit_message = "update image".to_string();
        PlanInput {
            deployment: Arc::new(deployment),
            target,
            running: None,
            last_successful_commit: last_successful.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_first_deployment_plans_quick_sync() {
        let dir = tempfile::tempdir().unwrap();
        let target = source(dir.path(), "abc123");
        let planner =
            KubernetesPlanner::new(Arc::new(Loader::new(Arc::new(ToolRegistry::new("/x")))));

        let plan = planner.plan(&plan_input(target, None)).await.unwrap();
        assert_eq!(plan.strategy, SyncStrategy::QuickSync);
        assert!(
            plan.summary
                .contains("unable to find the most recent successful commit"),
            "{}",
            plan.summary
        );
        assert_eq!(plan.stages[0].name, StageName::K8sSync);
        // auto rollback prepares the hidden rollback stage
        assert!(plan.stages.iter().any(|s| s.name == StageName::Rollback));
    }

    #[tokio::test]
    async fn test_rollback_marker_forces_quick_sync() {
        let dir = tempfile::tempdir().unwrap();
        let target = source(dir.path(), "abc123");
        let planner =
            KubernetesPlanner::new(Arc::new(Loader::new(Arc::new(ToolRegistry::new("/x")))));

        let mut input = plan_input(target, Some("def456"));
        let mut deployment = (*input.deployment).clone();
        deployment.trigger.commit_message =
            "Revert bad release /pipecd rollback def456".to_string();
        input.deployment = Arc::new(deployment);

        let plan = planner.plan(&input).await.unwrap();
        assert_eq!(plan.strategy, SyncStrategy::QuickSync);
        assert_eq!(plan.stages[0].name, StageName::K8sSync);
    }
}
