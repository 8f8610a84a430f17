//! Applying manifests to the cluster with server-side apply.

use crate::{APPLICATION_LABEL, COMMIT_ANNOTATION, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

use piped_model::{Manifest, ResourceKey};
use piped_runner::error::{Error, Result};

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::{Discovery, Scope};
use kube::Client;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const FIELD_MANAGER: &str = "piped";

/// The narrow contract executors program against; the kube-backed
/// implementation is swapped for a recording fake in tests.
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    async fn apply(&self, manifests: &[Manifest]) -> Result<()>;
    async fn delete(&self, keys: &[ResourceKey]) -> Result<()>;
}

pub struct KubeApplier {
    client: Client,
    discovery: RwLock<Discovery>,
}

impl KubeApplier {
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(|e| Error::Internal(format!("api discovery failed: {e}")))?;
        Ok(Self {
            client,
            discovery: RwLock::new(discovery),
        })
    }

    async fn api_for(&self, key: &ResourceKey) -> Result<Api<DynamicObject>> {
        let (group, version) = match key.api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), key.api_version.clone()),
        };
        let gvk = GroupVersionKind::gvk(&group, &version, &key.kind);
        let resolved = {
            let discovery = self.discovery.read().await;
            discovery
                .resolve_gvk(&gvk)
                .map(|(ar, caps)| (ar, caps.scope.clone()))
        };
        let (ar, scope) = match resolved {
            Some(resolved) => resolved,
            None => {
                // the kind may have been registered after startup (a CRD)
                let refreshed = Discovery::new(self.client.clone())
                    .run()
                    .await
                    .map_err(|e| Error::Internal(format!("api discovery failed: {e}")))?;
                let resolved = refreshed
                    .resolve_gvk(&gvk)
                    .map(|(ar, caps)| (ar, caps.scope.clone()))
                    .ok_or_else(|| {
                        Error::Config(format!("unknown resource kind {}/{}", key.api_version, key.kind))
                    })?;
                *self.discovery.write().await = refreshed;
                resolved
            }
        };
        Ok(match scope {
            Scope::Namespaced => {
                let namespace = if key.namespace.is_empty() {
                    self.client.default_namespace().to_string()
                } else {
                    key.namespace.clone()
                };
                Api::namespaced_with(self.client.clone(), &namespace, &ar)
            }
            Scope::Cluster => Api::all_with(self.client.clone(), &ar),
        })
    }
}

#[async_trait]
impl ManifestApplier for KubeApplier {
    async fn apply(&self, manifests: &[Manifest]) -> Result<()> {
        for manifest in manifests {
            let api = self.api_for(&manifest.key).await?;
            debug!(msg = "applying manifest", key = %manifest.key);
            api.patch(
                &manifest.key.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&manifest.body),
            )
            .await
            .map_err(|e| {
                Error::Internal(format!("failed to apply {}: {e}", manifest.key))
            })?;
        }
        info!(msg = "applied manifests", count = manifests.len());
        Ok(())
    }

    async fn delete(&self, keys: &[ResourceKey]) -> Result<()> {
        for key in keys {
            let api = self.api_for(key).await?;
            debug!(msg = "deleting resource", key = %key);
            match api.delete(&key.name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => {
                    return Err(Error::Internal(format!("failed to delete {key}: {e}")));
                }
            }
        }
        Ok(())
    }
}

/// Stamp the ownership labels and the commit annotation onto a manifest
/// before it is applied.
pub fn decorate(manifest: &mut Manifest, application_id: &str, commit_hash: &str) {
    set_label(manifest, MANAGED_BY_LABEL, MANAGED_BY_VALUE);
    set_label(manifest, APPLICATION_LABEL, application_id);
    manifest.add_annotation(COMMIT_ANNOTATION, commit_hash);
}

fn set_label(manifest: &mut Manifest, key: &str, value: &str) {
    let Some(root) = manifest.body.as_object_mut() else {
        return;
    };
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(meta) = metadata.as_object_mut() {
        let labels = meta
            .entry("labels")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(map) = labels.as_object_mut() {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decorate_stamps_ownership() {
        let mut manifest = Manifest::from_yaml_multi(
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n",
        )
        .unwrap()
        .remove(0);
        decorate(&mut manifest, "app-1", "abc123");
        assert_eq!(
            manifest.body["metadata"]["labels"][MANAGED_BY_LABEL],
            Value::String(MANAGED_BY_VALUE.to_string())
        );
        assert_eq!(
            manifest.body["metadata"]["labels"][APPLICATION_LABEL],
            Value::String("app-1".to_string())
        );
        assert_eq!(manifest.annotation(COMMIT_ANNOTATION), Some("abc123"));
    }
}
