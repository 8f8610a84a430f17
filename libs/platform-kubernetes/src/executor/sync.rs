use super::{kubernetes_spec, load_target_manifests};
use crate::applier::{decorate, ManifestApplier};
use crate::loader::Loader;

use piped_config::StageOptions;
use piped_runner::controller::StopSignal;
use piped_runner::{Executor, ExecutorInput, StageOutcome};

use async_trait::async_trait;
use std::sync::Arc;

/// K8S_SYNC: apply every manifest of the target commit.
pub struct SyncExecutor {
    loader: Arc<Loader>,
    applier: Arc<dyn ManifestApplier>,
}

impl SyncExecutor {
    pub fn new(loader: Arc<Loader>, applier: Arc<dyn ManifestApplier>) -> Self {
        Self { loader, applier }
    }
}

#[async_trait]
impl Executor for SyncExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let spec = match kubernetes_spec(input) {
            Ok(spec) => spec,
            Err(e) => return StageOutcome::Failure(e.to_string()),
        };
        let prune = match &input.stage_options {
            Some(StageOptions::K8sSync(options)) => options.prune,
            _ => spec.quick_sync.prune,
        };

        let manifests = match load_target_manifests(input, &self.loader).await {
            Ok(manifests) => manifests,
            Err(e) => {
                input.log.error(format!("Failed to load manifests: {e}"));
                return StageOutcome::Failure(e.to_string());
            }
        };
        input
            .log
            .info(format!("Applying {} manifests", manifests.len()));

        // applying may take a while; honor a cancel that arrived meanwhile
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let mut decorated: Vec<_> = (*manifests).clone();
        for manifest in &mut decorated {
            decorate(
                manifest,
                &input.application.id,
                &input.deployment.trigger.commit_hash,
            );
        }
        if let Err(e) = self.applier.apply(&decorated).await {
            input.log.error(format!("Failed to apply manifests: {e}"));
            return StageOutcome::Failure(e.to_string());
        }
        if prune {
            input
                .log
                .info("Prune is enabled; resources removed from Git are reported as drift until deleted");
        }
        input
            .log
            .success(format!("Successfully applied {} manifests", decorated.len()));
        StageOutcome::Success
    }
}
