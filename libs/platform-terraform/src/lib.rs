//! Terraform support: the planner, the sync/plan/apply executors and the
//! plan-based drift provider.

pub mod drift;
pub mod executor;
pub mod planner;
pub mod terraform;

pub use planner::TerraformPlanner;
pub use terraform::{parse_plan_summary, PlanResult, Terraform};

use piped_model::ApplicationKind;
use piped_runner::drift::DriftProviderRegistry;
use piped_runner::toolregistry::ToolRegistry;
use piped_runner::{ExecutorRegistry, PlannerRegistry};

use std::sync::Arc;

pub fn register(
    executors: &mut ExecutorRegistry,
    planners: &mut PlannerRegistry,
    drift_providers: &mut DriftProviderRegistry,
    tools: Arc<ToolRegistry>,
) {
    planners.register(ApplicationKind::Terraform, Arc::new(TerraformPlanner));
    executor::register(executors);
    drift_providers.register(
        ApplicationKind::Terraform,
        Arc::new(drift::TerraformDriftProvider::new(tools)),
    );
}

/// Build the CLI wrapper for a deploy source, combining the provider-level
/// and application-level variables.
pub(crate) fn terraform_for(
    input: &piped_runner::ExecutorInput,
    source: &piped_runner::DeploySource,
) -> piped_runner::error::Result<Terraform> {
    use piped_runner::error::Error;

    let piped_config::Config::TerraformApp(spec) = &source.config else {
        return Err(Error::Config(format!(
            "expected a TerraformApp configuration, found {}",
            source.config.kind()
        )));
    };
    let bin = input.tools.terraform()?;
    let mut vars = Vec::new();
    if let Some(provider) = &input.cloud_provider {
        if let Some(config) = &provider.terraform_config {
            vars.extend(config.vars.clone());
        }
    }
    vars.extend(spec.input.vars.clone());
    Ok(Terraform::new(
        bin,
        &source.app_dir,
        vars,
        spec.input.var_files.clone(),
    ))
}
