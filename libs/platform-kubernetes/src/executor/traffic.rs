use crate::applier::ManifestApplier;
use crate::VARIANT_LABEL;

use piped_config::StageOptions;
use piped_model::Manifest;
use piped_runner::controller::StopSignal;
use piped_runner::{Executor, ExecutorInput, StageOutcome};

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// K8S_TRAFFIC_ROUTING: point the service selector at one variant.
///
/// Only the `all: <variant>` form is supported; percentage-based splitting
/// needs a mesh provider in front of the workloads.
pub struct TrafficRoutingExecutor {
    applier: Arc<dyn ManifestApplier>,
}

impl TrafficRoutingExecutor {
    pub fn new(applier: Arc<dyn ManifestApplier>) -> Self {
        Self { applier }
    }
}

#[async_trait]
impl Executor for TrafficRoutingExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let options = match &input.stage_options {
            Some(StageOptions::K8sTrafficRouting(options)) => options.clone(),
            _ => Default::default(),
        };
        let Some(variant) = options.all.clone() else {
            return StageOutcome::Failure(
                "percentage-based traffic routing requires a mesh provider; use `all`"
                    .to_string(),
            );
        };

        // patch the application's Service to select the variant
        let service_patch = Manifest {
            key: piped_model::ResourceKey {
                api_version: "v1".to_string(),
                kind: "Service".to_string(),
                namespace: String::new(),
                name: input.application.name.clone(),
            },
            body: json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": { "name": input.application.name },
                "spec": { "selector": { VARIANT_LABEL: variant } }
            }),
        };
        input
            .log
            .info(format!("Routing all traffic to the {variant} variant"));
        if let Err(e) = self.applier.apply(&[service_patch]).await {
            input.log.error(format!("Traffic routing failed: {e}"));
            return StageOutcome::Failure(e.to_string());
        }
        input.log.success("Traffic routing updated");
        StageOutcome::Success
    }
}
