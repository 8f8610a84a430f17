//! Kubernetes stage executors.

pub mod rollback;
pub mod sync;
pub mod traffic;
pub mod variant;

use crate::applier::ManifestApplier;
use crate::loader::Loader;

use piped_config::{Config, KubernetesAppSpec};
use piped_model::{ApplicationKind, Manifest, StageName};
use piped_runner::error::{Error, Result};
use piped_runner::{ExecutorInput, ExecutorRegistry};

use std::sync::Arc;

pub fn register(
    executors: &mut ExecutorRegistry,
    loader: Arc<Loader>,
    applier: Arc<dyn ManifestApplier>,
) {
    let kind = ApplicationKind::Kubernetes;
    {
        let (loader, applier) = (loader.clone(), applier.clone());
        executors.register(
            kind,
            StageName::K8sSync,
            Arc::new(move || {
                Box::new(sync::SyncExecutor::new(loader.clone(), applier.clone()))
            }),
        );
    }
    {
        let (loader, applier) = (loader.clone(), applier.clone());
        executors.register(
            kind,
            StageName::K8sPrimaryRollout,
            Arc::new(move || {
                Box::new(variant::PrimaryRolloutExecutor::new(
                    loader.clone(),
                    applier.clone(),
                ))
            }),
        );
    }
    {
        let (loader, applier) = (loader.clone(), applier.clone());
        executors.register(
            kind,
            StageName::K8sCanaryRollout,
            Arc::new(move || {
                Box::new(variant::VariantRolloutExecutor::canary(
                    loader.clone(),
                    applier.clone(),
                ))
            }),
        );
    }
    {
        let (loader, applier) = (loader.clone(), applier.clone());
        executors.register(
            kind,
            StageName::K8sBaselineRollout,
            Arc::new(move || {
                Box::new(variant::VariantRolloutExecutor::baseline(
                    loader.clone(),
                    applier.clone(),
                ))
            }),
        );
    }
    {
        let (loader, applier) = (loader.clone(), applier.clone());
        executors.register(
            kind,
            StageName::K8sCanaryClean,
            Arc::new(move || {
                Box::new(variant::VariantCleanExecutor::canary(
                    loader.clone(),
                    applier.clone(),
                ))
            }),
        );
    }
    {
        let (loader, applier) = (loader.clone(), applier.clone());
        executors.register(
            kind,
            StageName::K8sBaselineClean,
            Arc::new(move || {
                Box::new(variant::VariantCleanExecutor::baseline(
                    loader.clone(),
                    applier.clone(),
                ))
            }),
        );
    }
    {
        let applier = applier.clone();
        executors.register(
            kind,
            StageName::K8sTrafficRouting,
            Arc::new(move || Box::new(traffic::TrafficRoutingExecutor::new(applier.clone()))),
        );
    }
    executors.register(
        kind,
        StageName::Rollback,
        Arc::new(move || {
            Box::new(rollback::RollbackExecutor::new(
                loader.clone(),
                applier.clone(),
            ))
        }),
    );
}

/// The Kubernetes application spec of the deployment's target source.
pub(crate) fn kubernetes_spec(input: &ExecutorInput) -> Result<&KubernetesAppSpec> {
    let source = input
        .target_source
        .as_ref()
        .ok_or_else(|| Error::Config("target deploy source is missing".to_string()))?;
    match &source.config {
        Config::KubernetesApp(spec) => Ok(spec),
        other => Err(Error::Config(format!(
            "expected a KubernetesApp configuration, found {}",
            other.kind()
        ))),
    }
}

/// Load the target manifests through the single-flight cache.
pub(crate) async fn load_target_manifests(
    input: &ExecutorInput,
    loader: &Loader,
) -> Result<Arc<Vec<Manifest>>> {
    let source = input
        .target_source
        .as_ref()
        .ok_or_else(|| Error::Config("target deploy source is missing".to_string()))?
        .clone();
    let spec = kubernetes_spec(input)?.clone();
    let config_filename = input.deployment.git_path.config_file().to_string();
    let key = (
        input.application.id.clone(),
        source.commit_hash.clone(),
    );
    input
        .manifests_cache
        .get_or_load(key, || async move {
            loader
                .load(&source.app_dir, &spec, &config_filename)
                .await
                .map(Arc::new)
        })
        .await
}
