use crate::sync_state::SyncState;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The runtime an application is deployed to.
///
/// The kind selects the planner and the executor set used for the
/// application's deployments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationKind {
    Kubernetes,
    Terraform,
    CloudRun,
    Lambda,
    Ecs,
}

impl ApplicationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationKind::Kubernetes => "KUBERNETES",
            ApplicationKind::Terraform => "TERRAFORM",
            ApplicationKind::CloudRun => "CLOUD_RUN",
            ApplicationKind::Lambda => "LAMBDA",
            ApplicationKind::Ecs => "ECS",
        }
    }
}

impl std::fmt::Display for ApplicationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of an application's configuration inside a Git repository.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitPath {
    pub repo_id: String,
    /// Directory of the application relative to the repository root.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_filename: Option<String>,
}

impl GitPath {
    /// Name of the application configuration file inside [`GitPath::path`].
    pub fn config_file(&self) -> &str {
        self.config_filename.as_deref().unwrap_or(".piped.yaml")
    }
}

/// An identified unit of deployment, owned by the control plane and cached
/// read-only on the agent side.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    pub name: String,
    pub env_id: String,
    pub kind: ApplicationKind,
    pub git_path: GitPath,
    pub cloud_provider: String,
    #[serde(default)]
    pub disabled: bool,
    /// Commit hash of the most recent successful deployment, empty until the
    /// first deployment succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub most_recent_successful_commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_state: Option<SyncState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_format() {
        let json = serde_json::to_string(&ApplicationKind::CloudRun).unwrap();
        assert_eq!(json, "\"CLOUD_RUN\"");
        let kind: ApplicationKind = serde_json::from_str("\"KUBERNETES\"").unwrap();
        assert_eq!(kind, ApplicationKind::Kubernetes);
    }

    #[test]
    fn test_git_path_config_file_default() {
        let git_path = GitPath {
            repo_id: "main".to_string(),
            path: "services/api".to_string(),
            config_filename: None,
        };
        assert_eq!(git_path.config_file(), ".piped.yaml");
    }
}
