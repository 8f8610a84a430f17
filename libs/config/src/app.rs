//! Per-application deployment configuration, one kind per runtime.

use crate::duration::ConfigDuration;
use crate::stage::{K8sSyncStageOptions, PipelineStage};

use serde::{Deserialize, Serialize};

/// Commit-message matchers that force a sync strategy regardless of the
/// changed paths.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitMatcher {
    #[serde(default)]
    pub quick_sync: Option<String>,
    #[serde(default)]
    pub pipeline: Option<String>,
}

impl CommitMatcher {
    pub fn validate(&self) -> Result<(), String> {
        for pattern in [&self.quick_sync, &self.pipeline].into_iter().flatten() {
            regex::Regex::new(pattern)
                .map_err(|e| format!("invalid commit matcher {pattern:?}: {e}"))?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub stages: Vec<PipelineStage>,
}

/// Fields shared by every application kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericAppSpec {
    #[serde(default)]
    pub pipeline: Option<Pipeline>,
    #[serde(default)]
    pub commit_matcher: CommitMatcher,
    /// Additional paths (relative to the repository root) whose changes
    /// trigger a deployment, on top of the application directory itself.
    #[serde(default)]
    pub trigger_paths: Vec<String>,
    /// Whole-deployment timeout.
    #[serde(default)]
    pub timeout: Option<ConfigDuration>,
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
}

fn default_true() -> bool {
    true
}

impl Default for GenericAppSpec {
    fn default() -> Self {
        Self {
            pipeline: None,
            commit_matcher: CommitMatcher::default(),
            trigger_paths: Vec::new(),
            timeout: None,
            auto_rollback: true,
        }
    }
}

impl GenericAppSpec {
    pub fn deployment_timeout(&self) -> std::time::Duration {
        self.timeout
            .map(|t| t.as_duration())
            .unwrap_or(crate::DEFAULT_DEPLOYMENT_TIMEOUT)
    }

    pub fn has_pipeline(&self) -> bool {
        self.pipeline
            .as_ref()
            .map(|p| !p.stages.is_empty())
            .unwrap_or(false)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.commit_matcher.validate()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesAppSpec {
    #[serde(flatten)]
    pub generic: GenericAppSpec,
    #[serde(default)]
    pub input: KubernetesDeploymentInput,
    #[serde(default)]
    pub quick_sync: K8sSyncStageOptions,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesDeploymentInput {
    /// Manifest files relative to the application directory. Empty means
    /// every `.yaml` in the directory.
    #[serde(default)]
    pub manifests: Vec<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Render with kustomize rooted at this directory instead of reading
    /// plain manifests.
    #[serde(default)]
    pub kustomize_dir: Option<String>,
    #[serde(default)]
    pub helm_chart: Option<HelmChart>,
    /// Label attached to every variant workload, keyed by this name.
    #[serde(default = "default_variant_label")]
    pub variant_label: String,
}

fn default_variant_label() -> String {
    "piped.dev/variant".to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChart {
    /// Chart directory relative to the application directory.
    pub path: String,
    #[serde(default)]
    pub release_name: Option<String>,
    #[serde(default)]
    pub values_files: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformAppSpec {
    #[serde(flatten)]
    pub generic: GenericAppSpec,
    #[serde(default)]
    pub input: TerraformDeploymentInput,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformDeploymentInput {
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub vars: Vec<String>,
    #[serde(default)]
    pub var_files: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRunAppSpec {
    #[serde(flatten)]
    pub generic: GenericAppSpec,
    #[serde(default)]
    pub input: CloudRunDeploymentInput,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRunDeploymentInput {
    #[serde(default = "default_service_manifest")]
    pub service_manifest_file: String,
}

fn default_service_manifest() -> String {
    "service.yaml".to_string()
}

impl Default for CloudRunDeploymentInput {
    fn default() -> Self {
        Self {
            service_manifest_file: default_service_manifest(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaAppSpec {
    #[serde(flatten)]
    pub generic: GenericAppSpec,
    #[serde(default)]
    pub input: LambdaDeploymentInput,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaDeploymentInput {
    #[serde(default = "default_function_manifest")]
    pub function_manifest_file: String,
}

fn default_function_manifest() -> String {
    "function.yaml".to_string()
}

impl Default for LambdaDeploymentInput {
    fn default() -> Self {
        Self {
            function_manifest_file: default_function_manifest(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsAppSpec {
    #[serde(flatten)]
    pub generic: GenericAppSpec,
    #[serde(default)]
    pub input: EcsDeploymentInput,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsDeploymentInput {
    #[serde(default = "default_service_definition")]
    pub service_definition_file: String,
    #[serde(default = "default_task_definition")]
    pub task_definition_file: String,
}

fn default_service_definition() -> String {
    "servicedef.yaml".to_string()
}

fn default_task_definition() -> String {
    "taskdef.yaml".to_string()
}

impl Default for EcsDeploymentInput {
    fn default() -> Self {
        Self {
            service_definition_file: default_service_definition(),
            task_definition_file: default_task_definition(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageOptions;

    const K8S_APP_YAML: &str = r#"
input:
  manifests:
    - deployment.yaml
    - service.yaml
  namespace: web
commitMatcher:
  quickSync: "^hotfix"
pipeline:
  stages:
    - name: K8S_CANARY_ROLLOUT
      with:
        replicas: 2
    - name: WAIT_APPROVAL
      with:
        approvers: ["alice"]
    - name: K8S_PRIMARY_ROLLOUT
    - name: K8S_CANARY_CLEAN
"#;

    #[test]
    fn test_parse_kubernetes_app_spec() {
        let spec: KubernetesAppSpec = serde_yaml::from_str(K8S_APP_YAML).unwrap();
        spec.generic.validate().unwrap();
        assert!(spec.generic.has_pipeline());
        assert!(spec.generic.auto_rollback);
        let stages = &spec.generic.pipeline.as_ref().unwrap().stages;
        assert_eq!(stages.len(), 4);
        match &stages[1].options {
            StageOptions::WaitApproval(o) => assert_eq!(o.approvers, vec!["alice".to_string()]),
            other => panic!("unexpected options: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_commit_matcher_is_rejected() {
        let spec: KubernetesAppSpec =
            serde_yaml::from_str("commitMatcher:\n  quickSync: '['\n").unwrap();
        assert!(spec.generic.validate().is_err());
    }

    #[test]
    fn test_defaults_for_slim_kinds() {
        let cloudrun: CloudRunAppSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cloudrun.input.service_manifest_file, "service.yaml");
        let lambda: LambdaAppSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(lambda.input.function_manifest_file, "function.yaml");
        let ecs: EcsAppSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(ecs.input.task_definition_file, "taskdef.yaml");
    }
}
