//! Loading the desired manifest set of an application.
//!
//! Three sources, in order of preference: a helm chart (rendered with
//! `helm template`), a kustomization (rendered with `kustomize build`),
//! or plain YAML files in the application directory.

use piped_config::app::{KubernetesAppSpec, KubernetesDeploymentInput};
use piped_model::Manifest;
use piped_runner::error::{Error, Result};
use piped_runner::toolregistry::ToolRegistry;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

pub struct Loader {
    tools: Arc<ToolRegistry>,
}

impl Loader {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }

    /// Load the manifests of the application rooted at `app_dir`.
    pub async fn load(
        &self,
        app_dir: &Path,
        spec: &KubernetesAppSpec,
        config_filename: &str,
    ) -> Result<Vec<Manifest>> {
        let input = &spec.input;
        let mut manifests = if let Some(chart) = &input.helm_chart {
            let chart_dir = app_dir.join(&chart.path);
            let mut args: Vec<String> = vec![
                "template".to_string(),
                chart
                    .release_name
                    .clone()
                    .unwrap_or_else(|| "piped".to_string()),
                chart_dir.to_string_lossy().into_owned(),
            ];
            for values in &chart.values_files {
                args.push("--values".to_string());
                args.push(app_dir.join(values).to_string_lossy().into_owned());
            }
            let rendered = self.render("helm", &args, app_dir).await?;
            Manifest::from_yaml_multi(&rendered)
                .map_err(|e| Error::Config(format!("invalid helm output: {e}")))?
        } else if let Some(kustomize_dir) = &input.kustomize_dir {
            let dir = app_dir.join(kustomize_dir);
            let args = vec!["build".to_string(), dir.to_string_lossy().into_owned()];
            let rendered = self.render("kustomize", &args, app_dir).await?;
            Manifest::from_yaml_multi(&rendered)
                .map_err(|e| Error::Config(format!("invalid kustomize output: {e}")))?
        } else {
            self.load_plain(app_dir, input, config_filename).await?
        };

        if let Some(namespace) = &input.namespace {
            for manifest in &mut manifests {
                if manifest.key.namespace.is_empty() {
                    manifest.key.namespace = namespace.clone();
                    if let Some(metadata) =
                        manifest.body.get_mut("metadata").and_then(|m| m.as_object_mut())
                    {
                        metadata.insert(
                            "namespace".to_string(),
                            serde_json::Value::String(namespace.clone()),
                        );
                    }
                }
            }
        }
        Ok(manifests)
    }

    async fn load_plain(
        &self,
        app_dir: &Path,
        input: &KubernetesDeploymentInput,
        config_filename: &str,
    ) -> Result<Vec<Manifest>> {
        let files: Vec<std::path::PathBuf> = if input.manifests.is_empty() {
            let mut files = Vec::new();
            let mut entries = tokio::fs::read_dir(app_dir)
                .await
                .map_err(|e| Error::Io(format!("read {}", app_dir.display()), e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::Io("walk application directory".to_string(), e))?
            {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                let is_yaml = name.ends_with(".yaml") || name.ends_with(".yml");
                if path.is_file() && is_yaml && name != config_filename {
                    files.push(path);
                }
            }
            files.sort();
            files
        } else {
            input.manifests.iter().map(|f| app_dir.join(f)).collect()
        };

        let mut manifests = Vec::new();
        for file in files {
            let data = tokio::fs::read_to_string(&file)
                .await
                .map_err(|e| Error::Io(format!("read {}", file.display()), e))?;
            let parsed = Manifest::from_yaml_multi(&data)
                .map_err(|e| Error::Config(format!("{}: {e}", file.display())))?;
            manifests.extend(parsed);
        }
        Ok(manifests)
    }

    async fn render(&self, tool: &str, args: &[String], cwd: &Path) -> Result<String> {
        let program = self.tools.resolve(tool)?;
        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Io(format!("run {tool}"), e))?;
        if !output.status.success() {
            return Err(Error::Config(format!(
                "{tool} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| Error::Config(format!("{tool} produced non-utf8 output: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 2
"#;
    const SERVICE: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: web
"#;

    fn loader() -> Loader {
        Loader::new(Arc::new(ToolRegistry::new("/nonexistent")))
    }

    #[tokio::test]
    async fn test_load_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deployment.yaml"), DEPLOYMENT).unwrap();
        std::fs::write(dir.path().join("service.yaml"), SERVICE).unwrap();
        std::fs::write(dir.path().join(".piped.yaml"), "kind: KubernetesApp\n").unwrap();

        let spec = KubernetesAppSpec::default();
        let manifests = loader()
            .load(dir.path(), &spec, ".piped.yaml")
            .await
            .unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].key.kind, "Deployment");
        assert_eq!(manifests[1].key.kind, "Service");
    }

    #[tokio::test]
    async fn test_namespace_is_injected_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deployment.yaml"), DEPLOYMENT).unwrap();

        let spec: KubernetesAppSpec =
            serde_yaml::from_str("input:\n  namespace: web-prod\n").unwrap();
        let manifests = loader()
            .load(dir.path(), &spec, ".piped.yaml")
            .await
            .unwrap();
        assert_eq!(manifests[0].key.namespace, "web-prod");
        assert_eq!(
            manifests[0].body["metadata"]["namespace"],
            serde_json::Value::String("web-prod".to_string())
        );
    }

    #[tokio::test]
    async fn test_listed_manifests_are_loaded_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), SERVICE).unwrap();
        std::fs::write(dir.path().join("b.yaml"), DEPLOYMENT).unwrap();

        let spec: KubernetesAppSpec =
            serde_yaml::from_str("input:\n  manifests: [b.yaml, a.yaml]\n").unwrap();
        let manifests = loader()
            .load(dir.path(), &spec, ".piped.yaml")
            .await
            .unwrap();
        assert_eq!(manifests[0].key.kind, "Deployment");
    }
}
