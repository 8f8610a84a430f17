use crate::applier::{decorate, ManifestApplier};
use crate::loader::Loader;

use piped_config::Config;
use piped_runner::controller::StopSignal;
use piped_runner::{Executor, ExecutorInput, StageOutcome};

use async_trait::async_trait;
use std::sync::Arc;

/// ROLLBACK: re-apply the manifests of the last successful commit.
pub struct RollbackExecutor {
    loader: Arc<Loader>,
    applier: Arc<dyn ManifestApplier>,
}

impl RollbackExecutor {
    pub fn new(loader: Arc<Loader>, applier: Arc<dyn ManifestApplier>) -> Self {
        Self { loader, applier }
    }
}

#[async_trait]
impl Executor for RollbackExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let Some(source) = input.running_source.as_ref() else {
            return StageOutcome::Failure(
                "unable to roll back: no successfully deployed commit".to_string(),
            );
        };
        let Config::KubernetesApp(spec) = &source.config else {
            return StageOutcome::Failure(format!(
                "unexpected configuration {} at the running commit",
                source.config.kind()
            ));
        };

        let config_filename = input.deployment.git_path.config_file();
        let mut manifests = match self
            .loader
            .load(&source.app_dir, spec, config_filename)
            .await
        {
            Ok(manifests) => manifests,
            Err(e) => {
                input
                    .log
                    .error(format!("Failed to load rollback manifests: {e}"));
                return StageOutcome::Failure(e.to_string());
            }
        };
        for manifest in &mut manifests {
            decorate(manifest, &input.application.id, &source.commit_hash);
        }
        input.log.info(format!(
            "Rolling back to commit {} ({} manifests)",
            source.commit_hash,
            manifests.len()
        ));
        if let Err(e) = self.applier.apply(&manifests).await {
            input.log.error(format!("Rollback failed: {e}"));
            return StageOutcome::Failure(e.to_string());
        }
        input
            .log
            .success(format!("Rolled back to commit {}", source.commit_hash));
        StageOutcome::Success
    }
}
