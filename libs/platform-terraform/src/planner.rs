use piped_config::Config;
use piped_model::StageName;
use piped_runner::error::{Error, Result};
use piped_runner::planner::{
    pipeline_stages, quick_sync_stages, Plan, PlanInput, Planner, SyncStrategy,
};

use async_trait::async_trait;

/// Terraform deployments either quick-sync (plan + apply in one stage) or
/// run the configured pipeline, typically TERRAFORM_PLAN → WAIT_APPROVAL →
/// TERRAFORM_APPLY.
pub struct TerraformPlanner;

#[async_trait]
impl Planner for TerraformPlanner {
    async fn plan(&self, input: &PlanInput) -> Result<Plan> {
        let Config::TerraformApp(spec) = &input.target.config else {
            return Err(Error::Config(
                "expected a TerraformApp configuration".to_string(),
            ));
        };
        let generic = &spec.generic;

        if !generic.has_pipeline() {
            let summary = "Quick sync by automatically applying the terraform plan";
            return Ok(Plan {
                strategy: SyncStrategy::QuickSync,
                summary: summary.to_string(),
                stages: quick_sync_stages(
                    StageName::TerraformSync,
                    summary,
                    generic.auto_rollback,
                ),
            });
        }
        if input.last_successful_commit.is_none() {
            let summary =
                "Quick sync, because it was unable to find the most recent successful commit";
            return Ok(Plan {
                strategy: SyncStrategy::QuickSync,
                summary: summary.to_string(),
                stages: quick_sync_stages(
                    StageName::TerraformSync,
                    summary,
                    generic.auto_rollback,
                ),
            });
        }

        Ok(Plan {
            strategy: SyncStrategy::Pipeline,
            summary: "Sync with the configured pipeline".to_string(),
            stages: pipeline_stages(
                generic.pipeline.as_ref().expect("pipeline exists"),
                generic.auto_rollback,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use piped_model::{ApplicationKind, GitPath};
    use piped_runner::deploysource::DeploySource;
    use std::sync::Arc;

    fn source(pipeline: bool) -> Arc<DeploySource> {
        let dir = tempfile::tempdir().unwrap();
        let config = if pipeline {
            r#"
apiVersion: piped.dev/v1beta1
kind: TerraformApp
spec:
  pipeline:
    stages:
      - name: TERRAFORM_PLAN
      - name: WAIT_APPROVAL
      - name: TERRAFORM_APPLY
"#
        } else {
            "apiVersion: piped.dev/v1beta1\nkind: TerraformApp\nspec: {}\n"
        };
        std::fs::create_dir_all(dir.path().join("infra")).unwrap();
        std::fs::write(dir.path().join("infra/.piped.yaml"), config).unwrap();
        let git_path = GitPath {
            repo_id: "main".to_string(),
            path: "infra".to_string(),
            config_filename: None,
        };
        let source = DeploySource::from_dir(dir.path(), &git_path, "abc").unwrap();
        // keep the tempdir alive through the test
        std::mem::forget(dir);
        Arc::new(source)
    }

    fn input(target: Arc<DeploySource>, last: Option<&str>) -> PlanInput {
        let application = app();
        PlanInput {
            deployment: Arc::new(deployment(&application)),
            target,
            running: None,
            last_successful_commit: last.map(str::to_string),
        }
    }

    fn app() -> piped_model::Application {
        piped_model::Application {
            id: "app-1".to_string(),
            name: "infra".to_string(),
            env_id: "env".to_string(),
            kind: ApplicationKind::Terraform,
            git_path: GitPath {
                repo_id: "main".to_string(),
                path: "infra".to_string(),
                config_filename: None,
            },
            cloud_provider: "terraform-default".to_string(),
            disabled: false,
            most_recent_successful_commit_hash: None,
            sync_state: None,
            updated_at: None,
        }
    }

    fn deployment(app: &piped_model::Application) -> piped_model::Deployment {
        piped_model::Deployment {
            id: "d-1".to_string(),
            application_id: app.id.clone(),
            application_name: app.name.clone(),
            env_id: app.env_id.clone(),
            piped_id: "piped-1".to_string(),
            kind: app.kind,
            git_path: app.git_path.clone(),
            trigger: Default::default(),
            running_commit_hash: String::new(),
            status: piped_model::DeploymentStatus::Pending,
            status_reason: String::new(),
            summary: String::new(),
            stages: Vec::new(),
            metadata: Default::default(),
            created_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_no_pipeline_is_quick_sync() {
        let plan = TerraformPlanner
            .plan(&input(source(false), Some("abc")))
            .await
            .unwrap();
        assert_eq!(plan.strategy, SyncStrategy::QuickSync);
        assert_eq!(plan.stages[0].name, StageName::TerraformSync);
    }

    #[tokio::test]
    async fn test_pipeline_with_history_is_progressive() {
        let plan = TerraformPlanner
            .plan(&input(source(true), Some("abc")))
            .await
            .unwrap();
        assert_eq!(plan.strategy, SyncStrategy::Pipeline);
        assert_eq!(plan.stages[0].name, StageName::TerraformPlan);
    }

    #[tokio::test]
    async fn test_first_deployment_is_quick_sync() {
        let plan = TerraformPlanner
            .plan(&input(source(true), None))
            .await
            .unwrap();
        assert_eq!(plan.strategy, SyncStrategy::QuickSync);
        assert!(plan
            .summary
            .contains("unable to find the most recent successful commit"));
    }
}
