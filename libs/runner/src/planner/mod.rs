//! Deployment planning.
//!
//! A planner turns a new deployment plus its Git sources into an ordered
//! stage list. Planners are pure given their input: the same configuration,
//! manifests and commit message always produce the same plan. Persistence
//! of the plan is the controller's job.

use crate::deploysource::DeploySource;
use crate::error::{Error, Result};

use piped_config::{GenericAppSpec, Pipeline, StageOptions};
use piped_model::{ApplicationKind, Deployment, Stage, StageName};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Commit messages containing this marker force a quick sync back to the
/// referenced commit, regardless of what changed.
pub const ROLLBACK_COMMIT_MARKER: &str = "/pipecd rollback ";

pub const ROLLBACK_STAGE_ID: &str = "stage-rollback";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStrategy {
    QuickSync,
    Pipeline,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::QuickSync => "QUICK_SYNC",
            SyncStrategy::Pipeline => "PIPELINE",
        }
    }
}

/// Everything a planner may look at.
pub struct PlanInput {
    pub deployment: Arc<Deployment>,
    pub target: Arc<DeploySource>,
    /// Tree at the currently running commit, absent for first deployments.
    pub running: Option<Arc<DeploySource>>,
    pub last_successful_commit: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Plan {
    pub strategy: SyncStrategy,
    pub summary: String,
    pub stages: Vec<Stage>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, input: &PlanInput) -> Result<Plan>;
}

/// Mapping application kind → planner, populated once at process start.
#[derive(Default)]
pub struct PlannerRegistry {
    planners: HashMap<ApplicationKind, Arc<dyn Planner>>,
}

impl PlannerRegistry {
    pub fn register(&mut self, kind: ApplicationKind, planner: Arc<dyn Planner>) {
        self.planners.insert(kind, planner);
    }

    pub fn get(&self, kind: ApplicationKind) -> Result<Arc<dyn Planner>> {
        self.planners
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::UnsupportedKind(kind.to_string()))
    }
}

/// Build the single-stage quick-sync pipeline, plus the hidden rollback
/// stage when rollback is enabled.
pub fn quick_sync_stages(sync_stage: StageName, desc: &str, auto_rollback: bool) -> Vec<Stage> {
    let mut stages = vec![Stage::new("stage-0", sync_stage, 0).with_desc(desc)];
    if auto_rollback {
        stages.push(rollback_stage(1));
    }
    stages
}

/// Build the progressive pipeline from configuration: a sequential chain,
/// each stage requiring its predecessor.
pub fn pipeline_stages(pipeline: &Pipeline, auto_rollback: bool) -> Vec<Stage> {
    let mut stages: Vec<Stage> = pipeline
        .stages
        .iter()
        .enumerate()
        .map(|(index, config)| {
            let id = config
                .id
                .clone()
                .unwrap_or_else(|| format!("stage-{index}"));
            let mut stage = Stage::new(id, config.name, index as u32);
            if let Some(desc) = &config.desc {
                stage = stage.with_desc(desc.clone());
            }
            stage
        })
        .collect();
    for index in 1..stages.len() {
        let previous = stages[index - 1].id.clone();
        stages[index].requires = vec![previous];
    }
    if auto_rollback {
        let index = stages.len() as u32;
        stages.push(rollback_stage(index));
    }
    stages
}

fn rollback_stage(index: u32) -> Stage {
    Stage::new(ROLLBACK_STAGE_ID, StageName::Rollback, index).hidden()
}

/// Options configured for a planned stage, matched by position among the
/// configured pipeline stages.
pub fn stage_options_for(generic: &GenericAppSpec, stage: &Stage) -> Option<StageOptions> {
    if stage.name == StageName::Rollback {
        return None;
    }
    let pipeline = generic.pipeline.as_ref()?;
    let config = pipeline.stages.get(stage.index as usize)?;
    if config.name != stage.name {
        return None;
    }
    Some(config.options.clone())
}

/// Timeout configured for a planned stage.
pub fn stage_timeout_for(generic: &GenericAppSpec, stage: &Stage) -> Option<std::time::Duration> {
    let pipeline = generic.pipeline.as_ref()?;
    let config = pipeline.stages.get(stage.index as usize)?;
    if config.name != stage.name {
        return None;
    }
    config.timeout.map(|t| t.as_duration())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(yaml: &str) -> Pipeline {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_quick_sync_stages_with_rollback() {
        let stages = quick_sync_stages(StageName::K8sSync, "apply all", true);
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].name, StageName::K8sSync);
        assert!(stages[0].visible);
        assert_eq!(stages[1].name, StageName::Rollback);
        assert!(!stages[1].visible);
        assert!(stages[1].requires.is_empty());
    }

    #[test]
    fn test_pipeline_stages_form_a_chain() {
        let p = pipeline(
            r#"
stages:
  - name: K8S_CANARY_ROLLOUT
  - name: WAIT_APPROVAL
  - name: K8S_PRIMARY_ROLLOUT
"#,
        );
        let stages = pipeline_stages(&p, false);
        assert_eq!(stages.len(), 3);
        assert!(stages[0].requires.is_empty());
        assert_eq!(stages[1].requires, vec!["stage-0".to_string()]);
        assert_eq!(stages[2].requires, vec!["stage-1".to_string()]);
    }

    #[test]
    fn test_stage_options_matched_by_index() {
        let generic = GenericAppSpec {
            pipeline: Some(pipeline(
                r#"
stages:
  - name: WAIT
    with:
      duration: 10s
  - name: K8S_PRIMARY_ROLLOUT
"#,
            )),
            ..Default::default()
        };
        let stages = pipeline_stages(generic.pipeline.as_ref().unwrap(), true);
        match stage_options_for(&generic, &stages[0]) {
            Some(StageOptions::Wait(o)) => {
                assert_eq!(o.duration.as_duration(), std::time::Duration::from_secs(10))
            }
            other => panic!("unexpected options: {other:?}"),
        }
        // the hidden rollback stage has no configured options
        assert!(stage_options_for(&generic, &stages[2]).is_none());
    }
}
