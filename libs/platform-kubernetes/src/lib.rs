//! Kubernetes support: manifest loading, the quick-sync/progressive
//! planner, the stage executors, the server-side-apply applier and the
//! informer-style live-state store.

pub mod applier;
pub mod diff;
pub mod drift;
pub mod executor;
pub mod livestate;
pub mod loader;
pub mod planner;

pub use applier::{KubeApplier, ManifestApplier};
pub use livestate::KubernetesLiveStateStore;
pub use loader::Loader;
pub use planner::KubernetesPlanner;

use piped_model::ApplicationKind;
use piped_runner::drift::DriftProviderRegistry;
use piped_runner::livestate::LiveStateGetter;
use piped_runner::{ExecutorRegistry, PlannerRegistry};

use std::sync::Arc;

/// Label put on every applied resource; the live-state store watches it.
pub const MANAGED_BY_LABEL: &str = "piped.dev/managed-by";
pub const MANAGED_BY_VALUE: &str = "piped";
/// Label carrying the owning application id.
pub const APPLICATION_LABEL: &str = "piped.dev/application-id";
/// Annotation recording the commit a resource was applied at.
pub const COMMIT_ANNOTATION: &str = "piped.dev/commit-hash";
/// Label distinguishing primary/canary/baseline workloads.
pub const VARIANT_LABEL: &str = "piped.dev/variant";

pub const PRIMARY_VARIANT: &str = "primary";
pub const CANARY_VARIANT: &str = "canary";
pub const BASELINE_VARIANT: &str = "baseline";

/// Wire the Kubernetes implementations into the agent registries. Invoked
/// once from the process wiring, before anything is scheduled.
pub fn register(
    executors: &mut ExecutorRegistry,
    planners: &mut PlannerRegistry,
    drift_providers: &mut DriftProviderRegistry,
    loader: Arc<Loader>,
    applier: Arc<dyn ManifestApplier>,
    live: Arc<dyn LiveStateGetter>,
) {
    planners.register(
        ApplicationKind::Kubernetes,
        Arc::new(KubernetesPlanner::new(loader.clone())),
    );
    executor::register(executors, loader.clone(), applier);
    drift_providers.register(
        ApplicationKind::Kubernetes,
        Arc::new(drift::KubernetesDriftProvider::new(loader, live)),
    );
}
