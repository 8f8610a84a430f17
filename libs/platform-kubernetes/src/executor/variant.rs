//! Variant workloads: primary, canary and baseline rollouts plus their
//! cleanup stages.

use super::{kubernetes_spec, load_target_manifests};
use crate::applier::{decorate, ManifestApplier};
use crate::diff::WORKLOAD_KIND;
use crate::loader::Loader;
use crate::{BASELINE_VARIANT, CANARY_VARIANT, PRIMARY_VARIANT, VARIANT_LABEL};

use piped_config::stage::Replicas;
use piped_config::StageOptions;
use piped_model::{Manifest, ResourceKey};
use piped_runner::controller::StopSignal;
use piped_runner::{Executor, ExecutorInput, StageOutcome};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// K8S_PRIMARY_ROLLOUT: apply the target manifests as the primary variant.
pub struct PrimaryRolloutExecutor {
    loader: Arc<Loader>,
    applier: Arc<dyn ManifestApplier>,
}

impl PrimaryRolloutExecutor {
    pub fn new(loader: Arc<Loader>, applier: Arc<dyn ManifestApplier>) -> Self {
        Self { loader, applier }
    }
}

#[async_trait]
impl Executor for PrimaryRolloutExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let add_to_selector = match &input.stage_options {
            Some(StageOptions::K8sPrimaryRollout(options)) => {
                options.add_variant_label_to_selector
            }
            _ => false,
        };
        let manifests = match load_target_manifests(input, &self.loader).await {
            Ok(manifests) => manifests,
            Err(e) => return StageOutcome::Failure(e.to_string()),
        };

        let mut decorated: Vec<Manifest> = (*manifests).clone();
        for manifest in &mut decorated {
            if manifest.key.kind == WORKLOAD_KIND {
                label_variant(manifest, PRIMARY_VARIANT, add_to_selector);
            }
            decorate(
                manifest,
                &input.application.id,
                &input.deployment.trigger.commit_hash,
            );
        }
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        input
            .log
            .info(format!("Rolling out {} manifests as primary", decorated.len()));
        if let Err(e) = self.applier.apply(&decorated).await {
            input.log.error(format!("Failed to roll out primary: {e}"));
            return StageOutcome::Failure(e.to_string());
        }
        input.log.success("Primary rollout completed");
        StageOutcome::Success
    }
}

/// K8S_CANARY_ROLLOUT / K8S_BASELINE_ROLLOUT: run a scaled copy of the
/// workload next to the primary one.
///
/// The canary runs the *target* commit's workload, the baseline the
/// currently *running* commit's workload.
pub struct VariantRolloutExecutor {
    loader: Arc<Loader>,
    applier: Arc<dyn ManifestApplier>,
    variant: &'static str,
}

impl VariantRolloutExecutor {
    pub fn canary(loader: Arc<Loader>, applier: Arc<dyn ManifestApplier>) -> Self {
        Self {
            loader,
            applier,
            variant: CANARY_VARIANT,
        }
    }

    pub fn baseline(loader: Arc<Loader>, applier: Arc<dyn ManifestApplier>) -> Self {
        Self {
            loader,
            applier,
            variant: BASELINE_VARIANT,
        }
    }

    async fn workloads(&self, input: &ExecutorInput) -> Result<Vec<Manifest>, String> {
        if self.variant == BASELINE_VARIANT {
            let source = input
                .running_source
                .as_ref()
                .ok_or_else(|| "baseline requires a running commit".to_string())?;
            let spec = match &source.config {
                piped_config::Config::KubernetesApp(spec) => spec.clone(),
                other => return Err(format!("unexpected configuration {}", other.kind())),
            };
            let config_filename = input.deployment.git_path.config_file();
            self.loader
                .load(&source.app_dir, &spec, config_filename)
                .await
                .map_err(|e| e.to_string())
        } else {
            load_target_manifests(input, &self.loader)
                .await
                .map(|m| (*m).clone())
                .map_err(|e| e.to_string())
        }
    }
}

#[async_trait]
impl Executor for VariantRolloutExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let replicas = match &input.stage_options {
            Some(StageOptions::K8sCanaryRollout(options)) => options.replicas,
            Some(StageOptions::K8sBaselineRollout(options)) => options.replicas,
            _ => Replicas::default(),
        };
        let manifests = match self.workloads(input).await {
            Ok(manifests) => manifests,
            Err(e) => {
                input.log.error(format!("Failed to load workloads: {e}"));
                return StageOutcome::Failure(e);
            }
        };
        let mut variants: Vec<Manifest> = manifests
            .iter()
            .filter(|m| m.key.kind == WORKLOAD_KIND)
            .map(|m| variant_workload(m, self.variant, replicas))
            .collect();
        if variants.is_empty() {
            return StageOutcome::Failure("no workload manifest was found".to_string());
        }
        for manifest in &mut variants {
            decorate(
                manifest,
                &input.application.id,
                &input.deployment.trigger.commit_hash,
            );
        }
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        input.log.info(format!(
            "Rolling out {} variant of {} workload(s)",
            self.variant,
            variants.len()
        ));
        if let Err(e) = self.applier.apply(&variants).await {
            input.log.error(format!("Failed to roll out {}: {e}", self.variant));
            return StageOutcome::Failure(e.to_string());
        }
        input
            .log
            .success(format!("Successfully rolled out {} variant", self.variant));
        StageOutcome::Success
    }
}

/// K8S_CANARY_CLEAN / K8S_BASELINE_CLEAN: remove the variant workloads.
pub struct VariantCleanExecutor {
    loader: Arc<Loader>,
    applier: Arc<dyn ManifestApplier>,
    variant: &'static str,
}

impl VariantCleanExecutor {
    pub fn canary(loader: Arc<Loader>, applier: Arc<dyn ManifestApplier>) -> Self {
        Self {
            loader,
            applier,
            variant: CANARY_VARIANT,
        }
    }

    pub fn baseline(loader: Arc<Loader>, applier: Arc<dyn ManifestApplier>) -> Self {
        Self {
            loader,
            applier,
            variant: BASELINE_VARIANT,
        }
    }
}

#[async_trait]
impl Executor for VariantCleanExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        if kubernetes_spec(input).is_err() {
            return StageOutcome::Failure("target deploy source is missing".to_string());
        }
        let manifests = match load_target_manifests(input, &self.loader).await {
            Ok(manifests) => manifests,
            Err(e) => return StageOutcome::Failure(e.to_string()),
        };
        let keys: Vec<ResourceKey> = manifests
            .iter()
            .filter(|m| m.key.kind == WORKLOAD_KIND)
            .map(|m| ResourceKey {
                name: variant_name(&m.key.name, self.variant),
                ..m.key.clone()
            })
            .collect();
        input
            .log
            .info(format!("Deleting {} {} workload(s)", keys.len(), self.variant));
        if let Err(e) = self.applier.delete(&keys).await {
            input.log.error(format!("Failed to clean {}: {e}", self.variant));
            return StageOutcome::Failure(e.to_string());
        }
        input
            .log
            .success(format!("Cleaned up {} variant", self.variant));
        StageOutcome::Success
    }
}

pub(crate) fn variant_name(name: &str, variant: &str) -> String {
    format!("{name}-{variant}")
}

/// Derive the variant copy of a workload: renamed, scaled, and labeled on
/// the selector and the pod template so its pods stay distinguishable.
pub(crate) fn variant_workload(workload: &Manifest, variant: &str, replicas: Replicas) -> Manifest {
    let mut manifest = workload.clone();
    manifest.key.name = variant_name(&manifest.key.name, variant);
    if let Some(metadata) = manifest.body.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert(
            "name".to_string(),
            Value::String(manifest.key.name.clone()),
        );
    }

    let primary_replicas = workload
        .field("spec/replicas")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;
    let scaled = replicas.calculate(primary_replicas).max(1);
    if let Some(spec) = manifest.body.get_mut("spec").and_then(Value::as_object_mut) {
        spec.insert("replicas".to_string(), Value::from(scaled));
    }

    label_variant(&mut manifest, variant, true);
    manifest
}

fn label_variant(manifest: &mut Manifest, variant: &str, add_to_selector: bool) {
    insert_label(&mut manifest.body, "metadata/labels", variant);
    insert_label(
        &mut manifest.body,
        "spec/template/metadata/labels",
        variant,
    );
    if add_to_selector {
        insert_label(&mut manifest.body, "spec/selector/matchLabels", variant);
    }
}

fn insert_label(body: &mut Value, path: &str, variant: &str) {
    let mut current = body;
    for part in path.split('/') {
        let Some(object) = current.as_object_mut() else {
            return;
        };
        current = object
            .entry(part)
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(
            VARIANT_LABEL.to_string(),
            Value::String(variant.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload() -> Manifest {
        Manifest::from_yaml_multi(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 4
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: app
          image: app:1.3
"#,
        )
        .unwrap()
        .remove(0)
    }

    #[test]
    fn test_variant_workload_rename_scale_label() {
        let canary = variant_workload(
            &workload(),
            CANARY_VARIANT,
            Replicas {
                number: 50,
                is_percentage: true,
            },
        );
        assert_eq!(canary.key.name, "web-canary");
        assert_eq!(canary.body["metadata"]["name"], "web-canary");
        assert_eq!(canary.body["spec"]["replicas"], 2);
        assert_eq!(
            canary.body["spec"]["selector"]["matchLabels"][VARIANT_LABEL],
            CANARY_VARIANT
        );
        assert_eq!(
            canary.body["spec"]["template"]["metadata"]["labels"][VARIANT_LABEL],
            CANARY_VARIANT
        );
        // the original keeps its selector
        assert_eq!(canary.body["spec"]["selector"]["matchLabels"]["app"], "web");
    }

    #[test]
    fn test_variant_workload_minimum_one_replica() {
        let canary = variant_workload(
            &workload(),
            CANARY_VARIANT,
            Replicas {
                number: 10,
                is_percentage: true,
            },
        );
        assert_eq!(canary.body["spec"]["replicas"], 1);
    }
}
