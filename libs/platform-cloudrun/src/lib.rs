//! Cloud Run support.
//!
//! The desired state is a Knative service manifest in Git; syncing replaces
//! the service through the `gcloud` CLI resolved by the tool registry, and
//! promotion shifts traffic to the latest revision.

use piped_config::piped::CloudRunCloudProviderConfig;
use piped_config::{Config, StageOptions};
use piped_model::{ApplicationKind, Manifest, StageName};
use piped_runner::controller::StopSignal;
use piped_runner::drift::DriftProviderRegistry;
use piped_runner::error::{Error, Result};
use piped_runner::planner::{
    pipeline_stages, quick_sync_stages, Plan, PlanInput, Planner, SyncStrategy,
};
use piped_runner::{
    DeploySource, Executor, ExecutorInput, ExecutorRegistry, PlannerRegistry, StageOutcome,
};

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

pub fn register(
    executors: &mut ExecutorRegistry,
    planners: &mut PlannerRegistry,
    _drift_providers: &mut DriftProviderRegistry,
) {
    let kind = ApplicationKind::CloudRun;
    planners.register(kind, Arc::new(CloudRunPlanner));
    executors.register(kind, StageName::CloudRunSync, Arc::new(|| Box::new(SyncExecutor)));
    executors.register(
        kind,
        StageName::CloudRunPromote,
        Arc::new(|| Box::new(PromoteExecutor)),
    );
    executors.register(kind, StageName::Rollback, Arc::new(|| Box::new(RollbackExecutor)));
}

/// The service manifest of a deploy source.
fn service_manifest(source: &DeploySource) -> Result<(PathBuf, Manifest)> {
    let Config::CloudRunApp(spec) = &source.config else {
        return Err(Error::Config(format!(
            "expected a CloudRunApp configuration, found {}",
            source.config.kind()
        )));
    };
    let path = source.app_dir.join(&spec.input.service_manifest_file);
    let data = std::fs::read_to_string(&path)
        .map_err(|e| Error::Io(format!("read {}", path.display()), e))?;
    let mut manifests = Manifest::from_yaml_multi(&data)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    if manifests.len() != 1 {
        return Err(Error::Config(format!(
            "{} must hold exactly one service manifest",
            path.display()
        )));
    }
    Ok((path, manifests.remove(0)))
}

fn provider_config(input: &ExecutorInput) -> Result<CloudRunCloudProviderConfig> {
    input
        .cloud_provider
        .as_ref()
        .and_then(|p| p.cloud_run_config.clone())
        .ok_or_else(|| {
            Error::Config(format!(
                "cloud provider {:?} has no Cloud Run configuration",
                input.application.cloud_provider
            ))
        })
}

async fn gcloud(
    input: &ExecutorInput,
    config: &CloudRunCloudProviderConfig,
    args: &[&str],
) -> Result<()> {
    let bin = input.tools.resolve("gcloud")?;
    let mut command = Command::new(bin);
    command
        .args(args)
        .arg("--project")
        .arg(&config.project)
        .arg("--region")
        .arg(&config.region)
        .arg("--quiet")
        .stdin(Stdio::null());
    if let Some(credentials) = &config.credentials_file {
        command.env("GOOGLE_APPLICATION_CREDENTIALS", credentials);
    }
    let output = command
        .output()
        .await
        .map_err(|e| Error::Io("run gcloud".to_string(), e))?;
    if !output.status.success() {
        return Err(Error::Internal(format!(
            "gcloud {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

pub struct CloudRunPlanner;

#[async_trait]
impl Planner for CloudRunPlanner {
    async fn plan(&self, input: &PlanInput) -> Result<Plan> {
        let Config::CloudRunApp(spec) = &input.target.config else {
            return Err(Error::Config(
                "expected a CloudRunApp configuration".to_string(),
            ));
        };
        // validate the manifest early so a broken one fails at plan time
        service_manifest(&input.target)?;
        let generic = &spec.generic;

        if generic.has_pipeline() && input.last_successful_commit.is_some() {
            return Ok(Plan {
                strategy: SyncStrategy::Pipeline,
                summary: "Sync progressively with the configured pipeline".to_string(),
                stages: pipeline_stages(
                    generic.pipeline.as_ref().expect("pipeline exists"),
                    generic.auto_rollback,
                ),
            });
        }
        let summary = if input.last_successful_commit.is_none() {
            "Quick sync, because it was unable to find the most recent successful commit"
        } else {
            "Quick sync by replacing the service manifest"
        };
        Ok(Plan {
            strategy: SyncStrategy::QuickSync,
            summary: summary.to_string(),
            stages: quick_sync_stages(StageName::CloudRunSync, summary, generic.auto_rollback),
        })
    }
}

/// CLOUD_RUN_SYNC: replace the service with the target manifest.
pub struct SyncExecutor;

#[async_trait]
impl Executor for SyncExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let Some(source) = input.target_source.clone() else {
            return StageOutcome::Failure("target deploy source is missing".to_string());
        };
        replace_service(input, &source).await
    }
}

/// CLOUD_RUN_PROMOTE: move a percentage of traffic to the latest revision.
pub struct PromoteExecutor;

#[async_trait]
impl Executor for PromoteExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let percent = match &input.stage_options {
            Some(StageOptions::CloudRunPromote(options)) => options.percent.min(100),
            _ => 100,
        };
        let Some(source) = input.target_source.clone() else {
            return StageOutcome::Failure("target deploy source is missing".to_string());
        };
        let (_, manifest) = match service_manifest(&source) {
            Ok(found) => found,
            Err(e) => return StageOutcome::Failure(e.to_string()),
        };
        let config = match provider_config(input) {
            Ok(config) => config,
            Err(e) => return StageOutcome::Failure(e.to_string()),
        };
        input.log.info(format!(
            "Shifting {percent}% of traffic to the latest revision of {}",
            manifest.key.name
        ));
        let revisions = format!("LATEST={percent}");
        if let Err(e) = gcloud(
            input,
            &config,
            &[
                "run",
                "services",
                "update-traffic",
                &manifest.key.name,
                "--to-revisions",
                &revisions,
            ],
        )
        .await
        {
            input.log.error(format!("Promotion failed: {e}"));
            return StageOutcome::Failure(e.to_string());
        }
        input.log.success(format!("Promoted to {percent}%"));
        StageOutcome::Success
    }
}

/// ROLLBACK: replace the service with the running commit's manifest.
pub struct RollbackExecutor;

#[async_trait]
impl Executor for RollbackExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let Some(source) = input.running_source.clone() else {
            return StageOutcome::Failure(
                "unable to roll back: no successfully deployed commit".to_string(),
            );
        };
        input
            .log
            .info(format!("Rolling back to commit {}", source.commit_hash));
        replace_service(input, &source).await
    }
}

async fn replace_service(input: &ExecutorInput, source: &DeploySource) -> StageOutcome {
    let (path, manifest) = match service_manifest(source) {
        Ok(found) => found,
        Err(e) => {
            input.log.error(format!("Failed to load service manifest: {e}"));
            return StageOutcome::Failure(e.to_string());
        }
    };
    let config = match provider_config(input) {
        Ok(config) => config,
        Err(e) => return StageOutcome::Failure(e.to_string()),
    };
    input
        .log
        .info(format!("Replacing service {}", manifest.key.name));
    let path = path.to_string_lossy().into_owned();
    if let Err(e) = gcloud(input, &config, &["run", "services", "replace", &path]).await {
        input.log.error(format!("Service replace failed: {e}"));
        return StageOutcome::Failure(e.to_string());
    }
    input
        .log
        .success(format!("Service {} is up to date", manifest.key.name));
    StageOutcome::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use piped_model::GitPath;

    const SERVICE: &str = r#"
apiVersion: serving.knative.dev/v1
kind: Service
metadata:
  name: hello
spec:
  template:
    spec:
      containers:
        - image: gcr.io/demo/hello:1.0
"#;

    fn source() -> DeploySource {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(
            dir.path().join("app/.piped.yaml"),
            "apiVersion: piped.dev/v1beta1\nkind: CloudRunApp\nspec: {}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("app/service.yaml"), SERVICE).unwrap();
        let git_path = GitPath {
            repo_id: "main".to_string(),
            path: "app".to_string(),
            config_filename: None,
        };
        let source = DeploySource::from_dir(dir.path(), &git_path, "abc").unwrap();
        std::mem::forget(dir);
        source
    }

    #[test]
    fn test_service_manifest_parses_name() {
        let (_, manifest) = service_manifest(&source()).unwrap();
        assert_eq!(manifest.key.name, "hello");
        assert_eq!(manifest.key.kind, "Service");
    }
}
