//! Terraform stage executors.

use crate::terraform_for;

use piped_config::Config;
use piped_model::{ApplicationKind, StageName};
use piped_runner::controller::StopSignal;
use piped_runner::{DeploySource, Executor, ExecutorInput, ExecutorRegistry, StageOutcome};

use async_trait::async_trait;
use std::sync::Arc;

pub fn register(executors: &mut ExecutorRegistry) {
    let kind = ApplicationKind::Terraform;
    executors.register(kind, StageName::TerraformSync, Arc::new(|| Box::new(SyncExecutor)));
    executors.register(kind, StageName::TerraformPlan, Arc::new(|| Box::new(PlanExecutor)));
    executors.register(
        kind,
        StageName::TerraformApply,
        Arc::new(|| Box::new(ApplyExecutor)),
    );
    executors.register(kind, StageName::Rollback, Arc::new(|| Box::new(RollbackExecutor)));
}

fn target_source(input: &ExecutorInput) -> Result<Arc<DeploySource>, String> {
    input
        .target_source
        .clone()
        .ok_or_else(|| "target deploy source is missing".to_string())
}

async fn prepare(
    input: &ExecutorInput,
    source: &DeploySource,
) -> Result<crate::Terraform, String> {
    let terraform = terraform_for(input, source).map_err(|e| e.to_string())?;
    let Config::TerraformApp(spec) = &source.config else {
        return Err("expected a TerraformApp configuration".to_string());
    };
    terraform.init().await.map_err(|e| e.to_string())?;
    if let Some(workspace) = &spec.input.workspace {
        terraform
            .select_workspace(workspace)
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(terraform)
}

/// TERRAFORM_SYNC: plan and immediately apply.
pub struct SyncExecutor;

#[async_trait]
impl Executor for SyncExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let source = match target_source(input) {
            Ok(source) => source,
            Err(e) => return StageOutcome::Failure(e),
        };
        let terraform = match prepare(input, &source).await {
            Ok(terraform) => terraform,
            Err(e) => {
                input.log.error(format!("Failed to initialize terraform: {e}"));
                return StageOutcome::Failure(e);
            }
        };
        let plan = match terraform.plan().await {
            Ok(plan) => plan,
            Err(e) => {
                input.log.error(format!("Terraform plan failed: {e}"));
                return StageOutcome::Failure(e.to_string());
            }
        };
        if !plan.has_changes {
            input.log.success("No changes to apply");
            return StageOutcome::Success;
        }
        input.log.info(plan.summary.clone());
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        if let Err(e) = terraform.apply().await {
            input.log.error(format!("Terraform apply failed: {e}"));
            return StageOutcome::Failure(e.to_string());
        }
        input.log.success("Successfully applied changes");
        StageOutcome::Success
    }
}

/// TERRAFORM_PLAN: compute and surface the plan, never mutate.
pub struct PlanExecutor;

#[async_trait]
impl Executor for PlanExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let source = match target_source(input) {
            Ok(source) => source,
            Err(e) => return StageOutcome::Failure(e),
        };
        let terraform = match prepare(input, &source).await {
            Ok(terraform) => terraform,
            Err(e) => return StageOutcome::Failure(e),
        };
        match terraform.plan().await {
            Ok(plan) => {
                input.log.info(plan.summary.clone());
                StageOutcome::Success
            }
            Err(e) => {
                input.log.error(format!("Terraform plan failed: {e}"));
                StageOutcome::Failure(e.to_string())
            }
        }
    }
}

/// TERRAFORM_APPLY: apply the target commit.
pub struct ApplyExecutor;

#[async_trait]
impl Executor for ApplyExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let source = match target_source(input) {
            Ok(source) => source,
            Err(e) => return StageOutcome::Failure(e),
        };
        apply_source(input, &source, &signal).await
    }
}

/// ROLLBACK: apply the running commit's configuration again.
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
        apply_source(input, &source, &signal).await
    }
}

async fn apply_source(
    input: &ExecutorInput,
    source: &DeploySource,
    signal: &StopSignal,
) -> StageOutcome {
    let terraform = match prepare(input, source).await {
        Ok(terraform) => terraform,
        Err(e) => {
            input.log.error(format!("Failed to initialize terraform: {e}"));
            return StageOutcome::Failure(e);
        }
    };
    if let Some(kind) = signal.signaled() {
        return StageOutcome::Cancelled(format!("{kind:?}"));
    }
    if let Err(e) = terraform.apply().await {
        input.log.error(format!("Terraform apply failed: {e}"));
        return StageOutcome::Failure(e.to_string());
    }
    input.log.success("Successfully applied changes");
    StageOutcome::Success
}
