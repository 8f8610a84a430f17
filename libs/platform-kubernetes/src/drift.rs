//! Kubernetes drift detection: desired manifests from the Git head
//! checkout against the live-state snapshot.

use crate::diff::subset_diff;
use crate::loader::Loader;

use piped_config::Config;
use piped_model::{Application, Manifest, ResourceKey, SyncState, SyncStatus};
use piped_runner::drift::DriftProvider;
use piped_runner::livestate::LiveStateGetter;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub struct KubernetesDriftProvider {
    loader: Arc<Loader>,
    live: Arc<dyn LiveStateGetter>,
}

impl KubernetesDriftProvider {
    pub fn new(loader: Arc<Loader>, live: Arc<dyn LiveStateGetter>) -> Self {
        Self { loader, live }
    }
}

#[async_trait]
impl DriftProvider for KubernetesDriftProvider {
    async fn detect(&self, application: &Application, repo_dir: &Path) -> SyncState {
        let app_dir = repo_dir.join(&application.git_path.path);
        let config_filename = application.git_path.config_file();
        let config = match piped_config::load_from_file(app_dir.join(config_filename)) {
            Ok(config) => config,
            Err(e) => {
                return SyncState::new(SyncStatus::InvalidConfig).with_reason(
                    "Unable to load the application configuration",
                    e.to_string(),
                );
            }
        };
        let Config::KubernetesApp(spec) = &config else {
            return SyncState::new(SyncStatus::InvalidConfig).with_reason(
                format!("Expected a KubernetesApp configuration, found {}", config.kind()),
                String::new(),
            );
        };
        let desired = match self.loader.load(&app_dir, spec, config_filename).await {
            Ok(desired) => desired,
            Err(e) => {
                return SyncState::new(SyncStatus::InvalidConfig)
                    .with_reason("Unable to load the desired manifests", e.to_string());
            }
        };
        let Some(live) = self.live.get(&application.id) else {
            return SyncState::new(SyncStatus::Unknown);
        };

        judge(&desired, &live.resources)
    }
}

/// Compare the desired set against the live resources. The verdict names
/// the first divergent resource.
pub fn judge(desired: &[Manifest], live: &[Manifest]) -> SyncState {
    for manifest in desired {
        let Some(live_manifest) = find_live(&manifest.key, live) else {
            return SyncState::new(SyncStatus::OutOfSync).with_reason(
                format!("{} {} is missing", manifest.key.kind, manifest.key.name),
                format!("Resource {} was not found in the cluster", manifest.key),
            );
        };
        // compare only the fields Git specifies; the live object carries
        // defaulted and status fields Git knows nothing about
        let (Some(desired_spec), Some(live_spec)) =
            (manifest.body.get("spec"), live_manifest.body.get("spec"))
        else {
            continue;
        };
        let divergent = subset_diff(desired_spec, live_spec);
        if !divergent.is_empty() {
            return SyncState::new(SyncStatus::OutOfSync).with_reason(
                format!("{} {} differs", manifest.key.kind, manifest.key.name),
                format!(
                    "Fields diverging on {}: {}",
                    manifest.key,
                    divergent.join(", ")
                ),
            );
        }
    }
    SyncState::new(SyncStatus::Synced)
}

fn find_live<'a>(desired: &ResourceKey, live: &'a [Manifest]) -> Option<&'a Manifest> {
    live.iter().find(|m| {
        m.key.kind == desired.kind
            && m.key.name == desired.name
            && (desired.namespace.is_empty()
                || m.key.namespace.is_empty()
                || m.key.namespace == desired.namespace)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use piped_model::GitPath;
    use piped_runner::livestate::AppLiveState;
    use piped_runner::toolregistry::ToolRegistry;

    fn manifest(replicas: u32) -> Manifest {
        Manifest::from_yaml_multi(&format!(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: default
spec:
  replicas: {replicas}
"#
        ))
        .unwrap()
        .remove(0)
    }

    #[test]
    fn test_judge_synced() {
        let state = judge(&[manifest(3)], &[manifest(3)]);
        assert_eq!(state.status, SyncStatus::Synced);
    }

    #[test]
    fn test_judge_out_of_sync_names_first_divergent_resource() {
        let state = judge(&[manifest(5)], &[manifest(3)]);
        assert_eq!(state.status, SyncStatus::OutOfSync);
        assert_eq!(state.short_reason, "Deployment web differs");
        assert!(state.reason.contains("replicas"), "{}", state.reason);
    }

    #[test]
    fn test_judge_missing_resource() {
        let state = judge(&[manifest(3)], &[]);
        assert_eq!(state.status, SyncStatus::OutOfSync);
        assert_eq!(state.short_reason, "Deployment web is missing");
    }

    #[test]
    fn test_judge_is_level_triggered() {
        let first = judge(&[manifest(5)], &[manifest(3)]);
        let second = judge(&[manifest(5)], &[manifest(3)]);
        assert!(first.same_observation(&second));
    }

    struct StaticLive(Option<AppLiveState>);

    impl LiveStateGetter for StaticLive {
        fn get(&self, _application_id: &str) -> Option<AppLiveState> {
            self.0.clone()
        }
    }

    fn provider(live: Option<AppLiveState>) -> KubernetesDriftProvider {
        KubernetesDriftProvider::new(
            Arc::new(Loader::new(Arc::new(ToolRegistry::new("/x")))),
            Arc::new(StaticLive(live)),
        )
    }

    fn application() -> Application {
        Application {
            id: "app-1".to_string(),
            name: "web".to_string(),
            env_id: "env".to_string(),
            kind: piped_model::ApplicationKind::Kubernetes,
            git_path: GitPath {
                repo_id: "main".to_string(),
                path: "app".to_string(),
                config_filename: None,
            },
            cloud_provider: "default".to_string(),
            disabled: false,
            most_recent_successful_commit_hash: None,
            sync_state: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_detect_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("app/.piped.yaml"), "kind: [broken\n").unwrap();

        let state = provider(None).detect(&application(), dir.path()).await;
        assert_eq!(state.status, SyncStatus::InvalidConfig);
        assert!(!state.reason.is_empty());
    }

    #[tokio::test]
    async fn test_detect_unknown_until_live_state_is_populated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(
            dir.path().join("app/.piped.yaml"),
            "apiVersion: piped.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("app/deployment.yaml"),
            manifest_yaml(3),
        )
        .unwrap();

        let state = provider(None).detect(&application(), dir.path()).await;
        assert_eq!(state.status, SyncStatus::Unknown);
    }

    fn manifest_yaml(replicas: u32) -> String {
        format!(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: default\nspec:\n  replicas: {replicas}\n"
        )
    }

    #[tokio::test]
    async fn test_detect_synced_against_live_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(
            dir.path().join("app/.piped.yaml"),
            "apiVersion: piped.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("app/deployment.yaml"), manifest_yaml(3)).unwrap();

        let live = AppLiveState {
            resources: vec![manifest(3)],
        };
        let state = provider(Some(live)).detect(&application(), dir.path()).await;
        assert_eq!(state.status, SyncStatus::Synced);
    }
}
