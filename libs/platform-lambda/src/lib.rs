//! AWS Lambda support.
//!
//! The desired state is a function manifest in Git describing the container
//! image a function runs. Syncing pushes the image through the `aws` CLI;
//! promotion publishes a version and shifts alias traffic to it.

use piped_config::piped::LambdaCloudProviderConfig;
use piped_config::{Config, StageOptions};
use piped_model::{ApplicationKind, StageName};
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
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

pub const TRAFFIC_ALIAS: &str = "piped";

pub fn register(
    executors: &mut ExecutorRegistry,
    planners: &mut PlannerRegistry,
    _drift_providers: &mut DriftProviderRegistry,
) {
    let kind = ApplicationKind::Lambda;
    planners.register(kind, Arc::new(LambdaPlanner));
    executors.register(kind, StageName::LambdaSync, Arc::new(|| Box::new(SyncExecutor)));
    executors.register(
        kind,
        StageName::LambdaPromote,
        Arc::new(|| Box::new(PromoteExecutor)),
    );
    executors.register(kind, StageName::Rollback, Arc::new(|| Box::new(RollbackExecutor)));
}

/// The function manifest stored next to the application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FunctionManifest {
    pub name: String,
    /// Container image URI the function runs.
    pub image: String,
    #[serde(default)]
    pub memory: Option<u32>,
    #[serde(default)]
    pub timeout: Option<u32>,
}

pub fn load_function_manifest(source: &DeploySource) -> Result<FunctionManifest> {
    let Config::LambdaApp(spec) = &source.config else {
        return Err(Error::Config(format!(
            "expected a LambdaApp configuration, found {}",
            source.config.kind()
        )));
    };
    let path = source.app_dir.join(&spec.input.function_manifest_file);
    let data = std::fs::read_to_string(&path)
        .map_err(|e| Error::Io(format!("read {}", path.display()), e))?;
    serde_yaml::from_str(&data).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

fn provider_config(input: &ExecutorInput) -> Result<LambdaCloudProviderConfig> {
    input
        .cloud_provider
        .as_ref()
        .and_then(|p| p.lambda_config.clone())
        .ok_or_else(|| {
            Error::Config(format!(
                "cloud provider {:?} has no Lambda configuration",
                input.application.cloud_provider
            ))
        })
}

async fn aws(
    input: &ExecutorInput,
    config: &LambdaCloudProviderConfig,
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
    if let Some(credentials) = &config.credentials_file {
        command.env("AWS_SHARED_CREDENTIALS_FILE", credentials);
    }
    let output = command
        .output()
        .await
        .map_err(|e| Error::Io("run aws".to_string(), e))?;
    if !output.status.success() {
        return Err(Error::Internal(format!(
            "aws {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub struct LambdaPlanner;

#[async_trait]
impl Planner for LambdaPlanner {
    async fn plan(&self, input: &PlanInput) -> Result<Plan> {
        let Config::LambdaApp(spec) = &input.target.config else {
            return Err(Error::Config(
                "expected a LambdaApp configuration".to_string(),
            ));
        };
        let manifest = load_function_manifest(&input.target)?;
        let generic = &spec.generic;

        if generic.has_pipeline() && input.last_successful_commit.is_some() {
            let summary = match input
                .running
                .as_ref()
                .and_then(|running| load_function_manifest(running).ok())
            {
                Some(old) if old.image != manifest.image => format!(
                    "Sync progressively because of updating image from {} to {}",
                    old.image, manifest.image
                ),
                _ => "Sync progressively with the configured pipeline".to_string(),
            };
            return Ok(Plan {
                strategy: SyncStrategy::Pipeline,
                summary,
                stages: pipeline_stages(
                    generic.pipeline.as_ref().expect("pipeline exists"),
                    generic.auto_rollback,
                ),
            });
        }
        let summary = if input.last_successful_commit.is_none() {
            "Quick sync, because it was unable to find the most recent successful commit"
        } else {
            "Quick sync by updating the function code"
        };
        Ok(Plan {
            strategy: SyncStrategy::QuickSync,
            summary: summary.to_string(),
            stages: quick_sync_stages(StageName::LambdaSync, summary, generic.auto_rollback),
        })
    }
}

/// LAMBDA_SYNC: point the function at the manifest's image.
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
        update_function(input, &source).await
    }
}

/// LAMBDA_PROMOTE: publish a version and shift alias traffic to it.
pub struct PromoteExecutor;

#[async_trait]
impl Executor for PromoteExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let percent = match &input.stage_options {
            Some(StageOptions::LambdaPromote(options)) => options.percent.min(100),
            _ => 100,
        };
        let Some(source) = input.target_source.clone() else {
            return StageOutcome::Failure("target deploy source is missing".to_string());
        };
        let manifest = match load_function_manifest(&source) {
            Ok(manifest) => manifest,
            Err(e) => return StageOutcome::Failure(e.to_string()),
        };
        let config = match provider_config(input) {
            Ok(config) => config,
            Err(e) => return StageOutcome::Failure(e.to_string()),
        };

        let version = match aws(
            input,
            &config,
            &[
                "lambda",
                "publish-version",
                "--function-name",
                &manifest.name,
                "--query",
                "Version",
            ],
        )
        .await
        {
            Ok(version) => version,
            Err(e) => {
                input.log.error(format!("Failed to publish version: {e}"));
                return StageOutcome::Failure(e.to_string());
            }
        };
        input.log.info(format!(
            "Shifting {percent}% of traffic of {} to version {version}",
            manifest.name
        ));
        let result = if percent >= 100 {
            aws(
                input,
                &config,
                &[
                    "lambda",
                    "update-alias",
                    "--function-name",
                    &manifest.name,
                    "--name",
                    TRAFFIC_ALIAS,
                    "--function-version",
                    &version,
                ],
            )
            .await
        } else {
            let weights = format!(
                "{{\"AdditionalVersionWeights\":{{\"{version}\":{}}}}}",
                f64::from(percent) / 100.0
            );
            aws(
                input,
                &config,
                &[
                    "lambda",
                    "update-alias",
                    "--function-name",
                    &manifest.name,
                    "--name",
                    TRAFFIC_ALIAS,
                    "--routing-config",
                    &weights,
                ],
            )
            .await
        };
        if let Err(e) = result {
            input.log.error(format!("Promotion failed: {e}"));
            return StageOutcome::Failure(e.to_string());
        }
        input.log.success(format!("Promoted version {version}"));
        StageOutcome::Success
    }
}

/// ROLLBACK: point the function back at the running commit's image.
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
        update_function(input, &source).await
    }
}

async fn update_function(input: &ExecutorInput, source: &DeploySource) -> StageOutcome {
    let manifest = match load_function_manifest(source) {
        Ok(manifest) => manifest,
        Err(e) => {
            input.log.error(format!("Failed to load function manifest: {e}"));
            return StageOutcome::Failure(e.to_string());
        }
    };
    let config = match provider_config(input) {
        Ok(config) => config,
        Err(e) => return StageOutcome::Failure(e.to_string()),
    };
    input.log.info(format!(
        "Updating function {} to image {}",
        manifest.name, manifest.image
    ));
    if let Err(e) = aws(
        input,
        &config,
        &[
            "lambda",
            "update-function-code",
            "--function-name",
            &manifest.name,
            "--image-uri",
            &manifest.image,
        ],
    )
    .await
    {
        input.log.error(format!("Function update failed: {e}"));
        return StageOutcome::Failure(e.to_string());
    }
    input
        .log
        .success(format!("Function {} is up to date", manifest.name));
    StageOutcome::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_manifest_parse() {
        let manifest: FunctionManifest = serde_yaml::from_str(
            "name: hello\nimage: 123.dkr.ecr.us-east-1.amazonaws.com/hello:1.0\nmemory: 256\n",
        )
        .unwrap();
        assert_eq!(manifest.name, "hello");
        assert_eq!(manifest.memory, Some(256));
    }

    #[test]
    fn test_function_manifest_rejects_unknown_fields() {
        assert!(
            serde_yaml::from_str::<FunctionManifest>("name: x\nimage: y\nrole: z\n").is_err()
        );
    }
}
