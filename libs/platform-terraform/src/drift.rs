//! Terraform drift: a non-empty plan at the Git head means the
//! infrastructure diverged from the desired configuration.

use crate::Terraform;

use piped_config::Config;
use piped_model::{Application, SyncState, SyncStatus};
use piped_runner::drift::DriftProvider;
use piped_runner::toolregistry::ToolRegistry;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub struct TerraformDriftProvider {
    tools: Arc<ToolRegistry>,
}

impl TerraformDriftProvider {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl DriftProvider for TerraformDriftProvider {
    async fn detect(&self, application: &Application, repo_dir: &Path) -> SyncState {
        let app_dir = repo_dir.join(&application.git_path.path);
        let config_path = app_dir.join(application.git_path.config_file());
        let config = match piped_config::load_from_file(&config_path) {
            Ok(config) => config,
            Err(e) => {
                return SyncState::new(SyncStatus::InvalidConfig).with_reason(
                    "Unable to load the application configuration",
                    e.to_string(),
                );
            }
        };
        let Config::TerraformApp(spec) = &config else {
            return SyncState::new(SyncStatus::InvalidConfig).with_reason(
                format!(
                    "Expected a TerraformApp configuration, found {}",
                    config.kind()
                ),
                String::new(),
            );
        };
        let bin = match self.tools.terraform() {
            Ok(bin) => bin,
            Err(e) => {
                return SyncState::new(SyncStatus::InvalidConfig)
                    .with_reason("terraform binary is not available", e.to_string());
            }
        };

        let terraform = Terraform::new(
            bin,
            &app_dir,
            spec.input.vars.clone(),
            spec.input.var_files.clone(),
        );
        if let Err(e) = terraform.init().await {
            return SyncState::new(SyncStatus::Unknown)
                .with_reason("terraform init failed", e.to_string());
        }
        match terraform.plan().await {
            Ok(plan) if plan.has_changes => SyncState::new(SyncStatus::OutOfSync)
                .with_reason("Terraform plan detected changes", plan.summary),
            Ok(_) => SyncState::new(SyncStatus::Synced),
            Err(e) => {
                SyncState::new(SyncStatus::Unknown).with_reason("terraform plan failed", e.to_string())
            }
        }
    }
}
