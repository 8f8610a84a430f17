use crate::duration::ConfigDuration;

use serde::{Deserialize, Serialize};

/// Agent configuration (`kind: Piped`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedSpec {
    #[serde(rename = "projectID")]
    pub project_id: String,
    #[serde(rename = "pipedID")]
    pub piped_id: String,
    /// Path of the file holding the piped signing key.
    pub piped_key_file: String,
    /// Address of the control-plane API, e.g. `https://pipecd.example.com`.
    #[serde(rename = "apiAddress")]
    pub api_address: String,
    /// Interval between store refreshes against the control plane.
    #[serde(default)]
    pub sync_interval: Option<ConfigDuration>,
    #[serde(default)]
    pub git: GitConfig,
    pub repositories: Vec<GitRepository>,
    #[serde(default)]
    pub cloud_providers: Vec<CloudProvider>,
    #[serde(default)]
    pub notifications: Notifications,
    #[serde(default)]
    pub sealed_secret_management: Option<SealedSecretManagement>,
}

impl PipedSpec {
    pub fn sync_interval(&self) -> std::time::Duration {
        self.sync_interval
            .map(|i| i.as_duration())
            .unwrap_or(crate::DEFAULT_SYNC_INTERVAL)
    }

    pub fn repository(&self, repo_id: &str) -> Option<&GitRepository> {
        self.repositories.iter().find(|r| r.repo_id == repo_id)
    }

    pub fn cloud_provider(&self, name: &str) -> Option<&CloudProvider> {
        self.cloud_providers.iter().find(|p| p.name == name)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.project_id.is_empty() {
            return Err("projectID must be set".to_string());
        }
        if self.piped_id.is_empty() {
            return Err("pipedID must be set".to_string());
        }
        if self.piped_key_file.is_empty() {
            return Err("pipedKeyFile must be set".to_string());
        }
        if self.api_address.is_empty() {
            return Err("apiAddress must be set".to_string());
        }
        if self.repositories.is_empty() {
            return Err("at least one repository must be configured".to_string());
        }
        let mut names: Vec<&str> = self.cloud_providers.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.cloud_providers.len() {
            return Err("cloud provider names must be unique".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    /// Username recorded on commits made by the agent.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Path to an SSH key used for Git over SSH.
    #[serde(default)]
    pub ssh_key_file: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepository {
    #[serde(rename = "repoId")]
    pub repo_id: String,
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "master".to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloudProviderType {
    Kubernetes,
    Terraform,
    CloudRun,
    Lambda,
    Ecs,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudProvider {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: CloudProviderType,
    #[serde(default)]
    pub kubernetes_config: Option<KubernetesCloudProviderConfig>,
    #[serde(default)]
    pub terraform_config: Option<TerraformCloudProviderConfig>,
    #[serde(default)]
    pub cloud_run_config: Option<CloudRunCloudProviderConfig>,
    #[serde(default)]
    pub lambda_config: Option<LambdaCloudProviderConfig>,
    #[serde(default)]
    pub ecs_config: Option<EcsCloudProviderConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesCloudProviderConfig {
    #[serde(default)]
    pub master_url: Option<String>,
    #[serde(default)]
    pub kube_config_path: Option<String>,
    /// Label put on every applied resource so the live-state store can watch
    /// only managed resources.
    #[serde(default)]
    pub managed_by_label: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformCloudProviderConfig {
    /// `-var` arguments passed to every terraform invocation.
    #[serde(default)]
    pub vars: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRunCloudProviderConfig {
    pub project: String,
    pub region: String,
    #[serde(default)]
    pub credentials_file: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaCloudProviderConfig {
    pub region: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub credentials_file: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsCloudProviderConfig {
    pub region: String,
    #[serde(default)]
    pub profile: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notifications {
    #[serde(default)]
    pub routes: Vec<NotificationRoute>,
    #[serde(default)]
    pub receivers: Vec<NotificationReceiver>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRoute {
    pub name: String,
    pub receiver: String,
    /// Event names to match, e.g. `DEPLOYMENT_TRIGGERED`. Empty matches all.
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default)]
    pub envs: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationReceiver {
    pub name: String,
    #[serde(default)]
    pub webhook: Option<WebhookReceiver>,
    #[serde(default)]
    pub slack: Option<SlackReceiver>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReceiver {
    pub url: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackReceiver {
    #[serde(rename = "hookURL")]
    pub hook_url: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedSecretManagement {
    #[serde(rename = "type")]
    pub management_type: String,
    #[serde(default)]
    pub private_key_file: Option<String>,
    #[serde(default)]
    pub public_key_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPED_YAML: &str = r#"
projectID: demo
pipedID: piped-1
pipedKeyFile: /etc/piped/key
apiAddress: https://pipecd.example.com
syncInterval: 30s
repositories:
  - repoId: main
    remote: https://github.com/org/deploys.git
    branch: main
cloudProviders:
  - name: kubernetes-default
    type: KUBERNETES
  - name: terraform-default
    type: TERRAFORM
    terraformConfig:
      vars: ["project=demo"]
notifications:
  receivers:
    - name: dev-slack
      slack:
        hookURL: https://hooks.slack.com/services/xxx
  routes:
    - name: deployments
      receiver: dev-slack
      events: ["DEPLOYMENT_TRIGGERED"]
"#;

    #[test]
    fn test_parse_piped_spec() {
        let spec: PipedSpec = serde_yaml::from_str(PIPED_YAML).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.sync_interval(), std::time::Duration::from_secs(30));
        assert_eq!(spec.repositories[0].branch, "main");
        assert_eq!(
            spec.cloud_provider("terraform-default")
                .unwrap()
                .provider_type,
            CloudProviderType::Terraform
        );
        assert_eq!(spec.notifications.routes[0].receiver, "dev-slack");
    }

    #[test]
    fn test_validate_rejects_missing_repositories() {
        let mut spec: PipedSpec = serde_yaml::from_str(PIPED_YAML).unwrap();
        spec.repositories.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_default_branch() {
        let repo: GitRepository = serde_yaml::from_str(
            "repoId: main\nremote: https://github.com/org/deploys.git\n",
        )
        .unwrap();
        assert_eq!(repo.branch, "master");
    }
}
