//! Amazon ECS support.
//!
//! The desired state is a task definition plus a service definition in
//! Git; syncing registers the task definition and points the service at
//! the new revision through the `aws` CLI.

use piped_config::piped::EcsCloudProviderConfig;
use piped_config::Config;
use piped_model::{ApplicationKind, StageName};
use piped_runner::controller::StopSignal;
use piped_runner::drift::DriftProviderRegistry;
use piped_runner::error::{Error, Result};
use piped_runner::planner::{quick_sync_stages, Plan, PlanInput, Planner, SyncStrategy};
use piped_runner::{
    DeploySource, Executor, ExecutorInput, ExecutorRegistry, PlannerRegistry, StageOutcome,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

pub fn register(
    executors: &mut ExecutorRegistry,
    planners: &mut PlannerRegistry,
    _drift_providers: &mut DriftProviderRegistry,
) {
    let kind = ApplicationKind::Ecs;
    planners.register(kind, Arc::new(EcsPlanner));
    executors.register(kind, StageName::EcsSync, Arc::new(|| Box::new(SyncExecutor)));
    executors.register(kind, StageName::Rollback, Arc::new(|| Box::new(RollbackExecutor)));
}

/// Where the service runs and which task definition backs it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceDefinition {
    pub cluster: String,
    pub service: String,
    #[serde(default)]
    pub desired_count: Option<u32>,
}

pub struct EcsDefinitions {
    pub service: ServiceDefinition,
    /// Raw task definition, registered verbatim.
    pub task_definition: serde_json::Value,
}

pub fn load_definitions(source: &DeploySource) -> Result<EcsDefinitions> {
    let Config::EcsApp(spec) = &source.config else {
        return Err(Error::Config(format!(
            "expected an EcsApp configuration, found {}",
            source.config.kind()
        )));
    };
    let service_path = source.app_dir.join(&spec.input.service_definition_file);
    let service_data = std::fs::read_to_string(&service_path)
        .map_err(|e| Error::Io(format!("read {}", service_path.display()), e))?;
    let service: ServiceDefinition = serde_yaml::from_str(&service_data)
        .map_err(|e| Error::Config(format!("{}: {e}", service_path.display())))?;

    let task_path = source.app_dir.join(&spec.input.task_definition_file);
    let task_data = std::fs::read_to_string(&task_path)
        .map_err(|e| Error::Io(format!("read {}", task_path.display()), e))?;
    let task_yaml: serde_yaml::Value = serde_yaml::from_str(&task_data)
        .map_err(|e| Error::Config(format!("{}: {e}", task_path.display())))?;
    let task_definition = serde_json::to_value(task_yaml)
        .map_err(|e| Error::Config(format!("{}: {e}", task_path.display())))?;

    Ok(EcsDefinitions {
        service,
        task_definition,
    })
}

fn provider_config(input: &ExecutorInput) -> Result<EcsCloudProviderConfig> {
    input
        .cloud_provider
        .as_ref()
        .and_then(|p| p.ecs_config.clone())
        .ok_or_else(|| {
            Error::Config(format!(
                "cloud provider {:?} has no ECS configuration",
                input.application.cloud_provider
            ))
        })
}

async fn aws(
    input: &ExecutorInput,
    config: &EcsCloudProviderConfig,
    args: &[&str],
) -> Result<String> {
    let bin = input.tools.resolve("aws")?;
    let mut command = Command::new(bin);
    command
        .args(args)
        .arg("--region")
        .arg(&config.region)
        .arg("--output")
        .arg("text")
        .stdin(Stdio::null());
    if let Some(profile) = &config.profile {
        command.arg("--profile").arg(profile);
    }
    let output = command
        .output()
        .await
        .map_err(|e| Error::Io("run aws".to_string(), e))?;
    if !output.status.success() {
        return Err(Error::Internal(format!(
            "aws {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub struct EcsPlanner;

#[async_trait]
impl Planner for EcsPlanner {
    async fn plan(&self, input: &PlanInput) -> Result<Plan> {
        let Config::EcsApp(spec) = &input.target.config else {
            return Err(Error::Config("expected an EcsApp configuration".to_string()));
        };
        load_definitions(&input.target)?;
        let summary = if input.last_successful_commit.is_none() {
            "Quick sync, because it was unable to find the most recent successful commit"
        } else {
            "Quick sync by registering the task definition and updating the service"
        };
        Ok(Plan {
            strategy: SyncStrategy::QuickSync,
            summary: summary.to_string(),
            stages: quick_sync_stages(StageName::EcsSync, summary, spec.generic.auto_rollback),
        })
    }
}

/// ECS_SYNC: register the task definition and roll the service onto it.
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
        sync_service(input, &source, &signal).await
    }
}

/// ROLLBACK: roll the service back onto the running commit's definitions.
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
        sync_service(input, &source, &signal).await
    }
}

async fn sync_service(
    input: &ExecutorInput,
    source: &DeploySource,
    signal: &StopSignal,
) -> StageOutcome {
    let definitions = match load_definitions(source) {
        Ok(definitions) => definitions,
        Err(e) => {
            input.log.error(format!("Failed to load definitions: {e}"));
            return StageOutcome::Failure(e.to_string());
        }
    };
    let config = match provider_config(input) {
        Ok(config) => config,
        Err(e) => return StageOutcome::Failure(e.to_string()),
    };

    let task_json = definitions.task_definition.to_string();
    input.log.info("Registering task definition");
    let task_arn = match aws(
        input,
        &config,
        &[
            "ecs",
            "register-task-definition",
            "--cli-input-json",
            &task_json,
            "--query",
            "taskDefinition.taskDefinitionArn",
        ],
    )
    .await
    {
        Ok(arn) => arn,
        Err(e) => {
            input.log.error(format!("Task definition registration failed: {e}"));
            return StageOutcome::Failure(e.to_string());
        }
    };

    if let Some(kind) = signal.signaled() {
        return StageOutcome::Cancelled(format!("{kind:?}"));
    }
    input.log.info(format!(
        "Updating service {} to task definition {task_arn}",
        definitions.service.service
    ));
    let mut args = vec![
        "ecs".to_string(),
        "update-service".to_string(),
        "--cluster".to_string(),
        definitions.service.cluster.clone(),
        "--service".to_string(),
        definitions.service.service.clone(),
        "--task-definition".to_string(),
        task_arn,
    ];
    if let Some(count) = definitions.service.desired_count {
        args.push("--desired-count".to_string());
        args.push(count.to_string());
    }
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    if let Err(e) = aws(input, &config, &arg_refs).await {
        input.log.error(format!("Service update failed: {e}"));
        return StageOutcome::Failure(e.to_string());
    }
    input.log.success(format!(
        "Service {} is rolling onto the new task definition",
        definitions.service.service
    ));
    StageOutcome::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use piped_model::GitPath;

    #[test]
    fn test_load_definitions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(
            dir.path().join("app/.piped.yaml"),
            "apiVersion: piped.dev/v1beta1\nkind: EcsApp\nspec: {}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("app/servicedef.yaml"),
            "cluster: demo\nservice: web\ndesiredCount: 2\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("app/taskdef.yaml"),
            "family: web\ncontainerDefinitions:\n  - name: app\n    image: app:1.0\n",
        )
        .unwrap();

        let git_path = GitPath {
            repo_id: "main".to_string(),
            path: "app".to_string(),
            config_filename: None,
        };
        let source = DeploySource::from_dir(dir.path(), &git_path, "abc").unwrap();
        let definitions = load_definitions(&source).unwrap();
        assert_eq!(definitions.service.cluster, "demo");
        assert_eq!(definitions.service.desired_count, Some(2));
        assert_eq!(definitions.task_definition["family"], "web");
    }
}
