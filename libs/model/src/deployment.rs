use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status of a deployment attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    Planned,
    Running,
    RollingBack,
    Success,
    Failure,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failure | DeploymentStatus::Cancelled
        )
    }
}

/// Status of a single stage inside a deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    NotStarted,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::NotStarted | StageStatus::Running)
    }

    /// Whether moving to `next` keeps the stage state machine monotonic.
    /// Terminal states are absorbing; re-reporting the same state is allowed
    /// because status updates are idempotent on the wire.
    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            StageStatus::NotStarted => true,
            StageStatus::Running => next != StageStatus::NotStarted,
            _ => false,
        }
    }
}

/// Name of a pipeline stage. The set of valid names depends on the
/// application kind; the executor registry enforces the pairing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageName {
    Wait,
    WaitApproval,
    Analysis,
    K8sSync,
    K8sPrimaryRollout,
    K8sCanaryRollout,
    K8sCanaryClean,
    K8sBaselineRollout,
    K8sBaselineClean,
    K8sTrafficRouting,
    TerraformSync,
    TerraformPlan,
    TerraformApply,
    CloudRunSync,
    CloudRunPromote,
    LambdaSync,
    LambdaPromote,
    EcsSync,
    Rollback,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Wait => "WAIT",
            StageName::WaitApproval => "WAIT_APPROVAL",
            StageName::Analysis => "ANALYSIS",
            StageName::K8sSync => "K8S_SYNC",
            StageName::K8sPrimaryRollout => "K8S_PRIMARY_ROLLOUT",
            StageName::K8sCanaryRollout => "K8S_CANARY_ROLLOUT",
            StageName::K8sCanaryClean => "K8S_CANARY_CLEAN",
            StageName::K8sBaselineRollout => "K8S_BASELINE_ROLLOUT",
            StageName::K8sBaselineClean => "K8S_BASELINE_CLEAN",
            StageName::K8sTrafficRouting => "K8S_TRAFFIC_ROUTING",
            StageName::TerraformSync => "TERRAFORM_SYNC",
            StageName::TerraformPlan => "TERRAFORM_PLAN",
            StageName::TerraformApply => "TERRAFORM_APPLY",
            StageName::CloudRunSync => "CLOUD_RUN_SYNC",
            StageName::CloudRunPromote => "CLOUD_RUN_PROMOTE",
            StageName::LambdaSync => "LAMBDA_SYNC",
            StageName::LambdaPromote => "LAMBDA_PROMOTE",
            StageName::EcsSync => "ECS_SYNC",
            StageName::Rollback => "ROLLBACK",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single step within a deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Unique within the deployment.
    pub id: String,
    pub name: StageName,
    #[serde(default)]
    pub desc: String,
    /// Zero-based position used for display ordering.
    pub index: u32,
    /// Ids of the stages that must be SUCCESS before this one may start.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Hidden stages (e.g. the prepared rollback stage) are kept out of the
    /// pipeline view until they run.
    #[serde(default = "default_visible")]
    pub visible: bool,
    pub status: StageStatus,
    #[serde(default)]
    pub status_reason: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub retried_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_visible() -> bool {
    true
}

impl Stage {
    pub fn new(id: impl Into<String>, name: StageName, index: u32) -> Self {
        Self {
            id: id.into(),
            name,
            desc: String::new(),
            index,
            requires: Vec::new(),
            visible: true,
            status: StageStatus::NotStarted,
            status_reason: String::new(),
            metadata: HashMap::new(),
            retried_count: 0,
            completed_at: None,
        }
    }

    pub fn with_requires(mut self, requires: Vec<String>) -> Self {
        self.requires = requires;
        self
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

/// What caused a deployment to be created.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTrigger {
    pub commit_hash: String,
    #[serde(default)]
    pub commit_message: String,
    #[serde(default)]
    pub commit_author: String,
    /// User that forced the deployment through a command, empty for
    /// commit-triggered deployments.
    #[serde(default)]
    pub commander: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// An attempt to converge an application to a specific commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub application_id: String,
    pub application_name: String,
    pub env_id: String,
    pub piped_id: String,
    pub kind: crate::application::ApplicationKind,
    pub git_path: crate::application::GitPath,
    pub trigger: DeploymentTrigger,
    /// Commit hash of the version running before this deployment, empty for
    /// the first deployment of an application.
    #[serde(default)]
    pub running_commit_hash: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_reason: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn stage_mut(&mut self, stage_id: &str) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.id == stage_id)
    }

    /// Stages that have not started and whose predecessors all completed
    /// successfully (a skipped predecessor counts as satisfied).
    pub fn eligible_stages(&self) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::NotStarted)
            .filter(|s| {
                s.requires.iter().all(|dep| {
                    self.stage(dep)
                        .map(|d| {
                            matches!(d.status, StageStatus::Success | StageStatus::Skipped)
                        })
                        .unwrap_or(false)
                })
            })
            .collect()
    }

    pub fn rollback_stage(&self) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == StageName::Rollback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(id: &str, status: StageStatus, requires: &[&str]) -> Stage {
        let mut s = Stage::new(id, StageName::Wait, 0);
        s.status = status;
        s.requires = requires.iter().map(|r| r.to_string()).collect();
        s
    }

    fn deployment(stages: Vec<Stage>) -> Deployment {
        Deployment {
            id: "d-1".to_string(),
            application_id: "app-1".to_string(),
            application_name: "demo".to_string(),
            env_id: "env-1".to_string(),
            piped_id: "piped-1".to_string(),
            kind: crate::application::ApplicationKind::Kubernetes,
            git_path: Default::default(),
            trigger: Default::default(),
            running_commit_hash: String::new(),
            status: DeploymentStatus::Planned,
            status_reason: String::new(),
            summary: String::new(),
            stages,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_stage_status_terminal_is_absorbing() {
        for terminal in [
            StageStatus::Success,
            StageStatus::Failure,
            StageStatus::Cancelled,
            StageStatus::Skipped,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(StageStatus::Running));
            assert!(!terminal.can_transition_to(StageStatus::NotStarted));
            // idempotent duplicate report
            assert!(terminal.can_transition_to(terminal));
        }
    }

    #[test]
    fn test_stage_status_running_cannot_go_back() {
        assert!(StageStatus::Running.can_transition_to(StageStatus::Success));
        assert!(StageStatus::Running.can_transition_to(StageStatus::Cancelled));
        assert!(!StageStatus::Running.can_transition_to(StageStatus::NotStarted));
    }

    #[test]
    fn test_eligible_stages_respect_predecessors() {
        let d = deployment(vec![
            stage("s1", StageStatus::Success, &[]),
            stage("s2", StageStatus::NotStarted, &["s1"]),
            stage("s3", StageStatus::NotStarted, &["s2"]),
        ]);
        let eligible: Vec<_> = d.eligible_stages().iter().map(|s| s.id.clone()).collect();
        assert_eq!(eligible, vec!["s2".to_string()]);
    }

    #[test]
    fn test_eligible_stages_skip_failed_predecessor() {
        let d = deployment(vec![
            stage("s1", StageStatus::Failure, &[]),
            stage("s2", StageStatus::NotStarted, &["s1"]),
        ]);
        assert!(d.eligible_stages().is_empty());
    }

    #[test]
    fn test_deployment_status_terminal() {
        assert!(DeploymentStatus::Success.is_terminal());
        assert!(DeploymentStatus::Cancelled.is_terminal());
        assert!(!DeploymentStatus::RollingBack.is_terminal());
    }
}
