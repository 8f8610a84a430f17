use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of a user-initiated imperative from the control plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    SyncApplication,
    CancelDeployment,
    ApproveStage,
}

/// A command created by the control plane and observed by the agent through
/// the command store. Acknowledged back at most once.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub deployment_id: String,
    #[serde(default)]
    pub stage_id: String,
    /// User that issued the command.
    #[serde(default)]
    pub commander: String,
    #[serde(default)]
    pub handled: bool,
    /// Only meaningful for CANCEL_DEPLOYMENT.
    #[serde(default)]
    pub force_rollback: bool,
    #[serde(default)]
    pub force_no_rollback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Command {
    pub fn is_cancel_for(&self, deployment_id: &str) -> bool {
        self.command_type == CommandType::CancelDeployment && self.deployment_id == deployment_id
    }

    pub fn is_approval_for(&self, deployment_id: &str, stage_id: &str) -> bool {
        self.command_type == CommandType::ApproveStage
            && self.deployment_id == deployment_id
            && self.stage_id == stage_id
    }
}
