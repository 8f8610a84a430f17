//! Stage execution.
//!
//! Executors share one narrow contract: given an input bundle and a stop
//! signal, run one stage and report how it ended. `Exited` means the stage
//! still needs another tick (used by gates like WAIT_APPROVAL and
//! ANALYSIS); the scheduler re-invokes the same executor instance until it
//! reaches a terminal outcome.

pub mod analysis;
pub mod wait;
pub mod wait_approval;

use crate::apistore::CommandLister;
use crate::cache::AppManifestsCache;
use crate::controller::log_persister::StageLogPersister;
use crate::controller::metadata::MetadataStore;
use crate::controller::signal::StopSignal;
use crate::deploysource::DeploySource;
use crate::toolregistry::ToolRegistry;

use piped_config::piped::CloudProvider;
use piped_config::StageOptions;
use piped_model::{Application, ApplicationKind, Deployment, Stage, StageName};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// How a stage execution ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    Failure(String),
    Cancelled(String),
    Skipped(String),
    /// Not finished yet; run again on the next tick.
    Exited,
}

/// Value-typed bundle of everything an executor may need. No ambient
/// context: executors receive their whole world here.
pub struct ExecutorInput {
    pub application: Arc<Application>,
    pub deployment: Arc<Deployment>,
    pub stage: Stage,
    pub stage_options: Option<StageOptions>,
    pub stage_started_at: DateTime<Utc>,
    pub target_source: Option<Arc<DeploySource>>,
    pub running_source: Option<Arc<DeploySource>>,
    pub cloud_provider: Option<CloudProvider>,
    pub commands: CommandLister,
    pub log: StageLogPersister,
    pub metadata: MetadataStore,
    pub manifests_cache: Arc<AppManifestsCache>,
    pub tools: Arc<ToolRegistry>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome;
}

/// Creates one executor instance per stage attempt. The instance lives for
/// the whole attempt, so gate executors can keep state across ticks.
pub type ExecutorFactory = Arc<dyn Fn() -> Box<dyn Executor> + Send + Sync>;

/// Two-level mapping (application kind, stage name) → executor factory.
///
/// Registration happens once at process start from the main wiring; lookup
/// failure at execution time fails the stage with "unsupported stage".
#[derive(Default)]
pub struct ExecutorRegistry {
    by_kind: HashMap<(ApplicationKind, StageName), ExecutorFactory>,
    /// Kind-independent stages (WAIT, WAIT_APPROVAL, ANALYSIS).
    common: HashMap<StageName, ExecutorFactory>,
}

impl ExecutorRegistry {
    pub fn register(
        &mut self,
        kind: ApplicationKind,
        stage: StageName,
        factory: ExecutorFactory,
    ) {
        self.by_kind.insert((kind, stage), factory);
    }

    pub fn register_common(&mut self, stage: StageName, factory: ExecutorFactory) {
        self.common.insert(stage, factory);
    }

    pub fn resolve(&self, kind: ApplicationKind, stage: StageName) -> Option<Box<dyn Executor>> {
        self.by_kind
            .get(&(kind, stage))
            .or_else(|| self.common.get(&stage))
            .map(|factory| factory())
    }

    /// Install the generic gate executors shared by every kind.
    pub fn register_generic_stages(&mut self) {
        self.register_common(StageName::Wait, Arc::new(|| Box::new(wait::WaitExecutor)));
        self.register_common(
            StageName::WaitApproval,
            Arc::new(|| Box::new(wait_approval::WaitApprovalExecutor)),
        );
        self.register_common(
            StageName::Analysis,
            Arc::new(|| Box::<analysis::AnalysisExecutor>::default()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Always(StageOutcome);

    #[async_trait]
    impl Executor for Always {
        async fn execute(&self, _input: &ExecutorInput, _signal: StopSignal) -> StageOutcome {
            self.0.clone()
        }
    }

    #[test]
    fn test_kind_specific_wins_over_common() {
        let mut registry = ExecutorRegistry::default();
        registry.register_common(
            StageName::Wait,
            Arc::new(|| Box::new(Always(StageOutcome::Exited))),
        );
        registry.register(
            ApplicationKind::Kubernetes,
            StageName::Wait,
            Arc::new(|| Box::new(Always(StageOutcome::Success))),
        );
        assert!(registry
            .resolve(ApplicationKind::Kubernetes, StageName::Wait)
            .is_some());
        assert!(registry
            .resolve(ApplicationKind::Terraform, StageName::Wait)
            .is_some());
        assert!(registry
            .resolve(ApplicationKind::Terraform, StageName::K8sSync)
            .is_none());
    }
}
