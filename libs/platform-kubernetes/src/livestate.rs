//! Informer-style cache of the live cluster resources managed by this
//! agent.
//!
//! One watch per resource kind, filtered by the managed-by label the
//! applier stamps on everything it applies. Each watch keeps the shared
//! per-application snapshot current and feeds observed changes into the
//! live-state event queue consumed by the reporter.

use crate::{APPLICATION_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

use piped_api_client::rpc::{LiveStateEvent, LiveStateEventType};
use piped_model::{Manifest, ResourceKey};
use piped_runner::error::Result;
use piped_runner::livestate::{AppLiveState, LiveStateEventQueue, LiveStateGetter};
use piped_runner::supervisor::Component;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DynamicObject};
use kube::core::ApiResource;
use kube::runtime::watcher;
use kube::Client;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type AppResources = HashMap<String, HashMap<ResourceKey, Manifest>>;

struct Shared {
    state: RwLock<AppResources>,
    synced_watches: AtomicUsize,
    total_watches: usize,
}

pub struct KubernetesLiveStateStore {
    client: Client,
    shared: Arc<Shared>,
    queue: LiveStateEventQueue,
}

/// Cheap cloneable read handle.
#[derive(Clone)]
pub struct KubernetesLiveStateGetter {
    shared: Arc<Shared>,
}

impl LiveStateGetter for KubernetesLiveStateGetter {
    fn get(&self, application_id: &str) -> Option<AppLiveState> {
        if self.shared.synced_watches.load(Ordering::SeqCst) < self.shared.total_watches {
            return None;
        }
        let state = self.shared.state.read();
        Some(AppLiveState {
            resources: state
                .get(application_id)
                .map(|resources| resources.values().cloned().collect())
                .unwrap_or_default(),
        })
    }
}

fn watched_resources() -> Vec<ApiResource> {
    vec![
        ApiResource::erase::<Deployment>(&()),
        ApiResource::erase::<ReplicaSet>(&()),
        ApiResource::erase::<Pod>(&()),
        ApiResource::erase::<Service>(&()),
        ApiResource::erase::<ConfigMap>(&()),
        ApiResource::erase::<Secret>(&()),
        ApiResource::erase::<Ingress>(&()),
    ]
}

impl KubernetesLiveStateStore {
    pub fn new(client: Client, queue: LiveStateEventQueue) -> Self {
        let shared = Arc::new(Shared {
            state: RwLock::new(HashMap::new()),
            synced_watches: AtomicUsize::new(0),
            total_watches: watched_resources().len(),
        });
        Self {
            client,
            shared,
            queue,
        }
    }

    pub fn getter(&self) -> KubernetesLiveStateGetter {
        KubernetesLiveStateGetter {
            shared: self.shared.clone(),
        }
    }

    async fn watch_resource(
        shared: Arc<Shared>,
        queue: LiveStateEventQueue,
        client: Client,
        ar: ApiResource,
        shutdown: CancellationToken,
    ) {
        let api: Api<DynamicObject> = Api::all_with(client, &ar);
        let config = watcher::Config::default()
            .labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"));
        let mut stream = std::pin::pin!(watcher(api, config));
        let mut pending: HashMap<ResourceKey, (String, Manifest)> = HashMap::new();
        let mut synced = false;

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return,
                event = stream.next() => event,
            };
            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    debug!(msg = "watch interrupted, retrying", kind = %ar.kind, err = %e);
                    continue;
                }
                None => return,
            };
            match event {
                watcher::Event::Init => pending.clear(),
                watcher::Event::InitApply(obj) => {
                    if let Some((app_id, key, manifest)) = convert(obj, &ar) {
                        pending.insert(key, (app_id, manifest));
                    }
                }
                watcher::Event::InitDone => {
                    Self::resync(&shared, &ar, std::mem::take(&mut pending));
                    if !synced {
                        synced = true;
                        shared.synced_watches.fetch_add(1, Ordering::SeqCst);
                    }
                }
                watcher::Event::Apply(obj) => {
                    let Some((app_id, key, manifest)) = convert(obj, &ar) else {
                        continue;
                    };
                    let added = {
                        let mut state = shared.state.write();
                        state
                            .entry(app_id.clone())
                            .or_default()
                            .insert(key.clone(), manifest.clone())
                            .is_none()
                    };
                    queue.push(LiveStateEvent {
                        application_id: app_id,
                        event_type: if added {
                            LiveStateEventType::Added
                        } else {
                            LiveStateEventType::Updated
                        },
                        resource_key: key,
                        state: Some(manifest.body),
                        observed_at: Utc::now(),
                    });
                }
                watcher::Event::Delete(obj) => {
                    let Some((app_id, key, _)) = convert(obj, &ar) else {
                        continue;
                    };
                    {
                        let mut state = shared.state.write();
                        if let Some(resources) = state.get_mut(&app_id) {
                            resources.remove(&key);
                        }
                    }
                    queue.push(LiveStateEvent {
                        application_id: app_id,
                        event_type: LiveStateEventType::Deleted,
                        resource_key: key,
                        state: None,
                        observed_at: Utc::now(),
                    });
                }
            }
        }
    }

    /// Replace every cached resource of this kind with the freshly listed
    /// set. Re-list happens on watch restarts; no events are emitted for
    /// it, the reporter's consumers resync from snapshots.
    fn resync(
        shared: &Shared,
        ar: &ApiResource,
        pending: HashMap<ResourceKey, (String, Manifest)>,
    ) {
        let mut state = shared.state.write();
        for resources in state.values_mut() {
            resources.retain(|key, _| {
                !(key.kind == ar.kind && key.api_version == ar.api_version)
            });
        }
        for (key, (app_id, manifest)) in pending {
            state.entry(app_id).or_default().insert(key, manifest);
        }
    }
}

fn convert(obj: DynamicObject, ar: &ApiResource) -> Option<(String, ResourceKey, Manifest)> {
    let app_id = obj.metadata.labels.as_ref()?.get(APPLICATION_LABEL)?.clone();
    let name = obj.metadata.name.clone()?;
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let key = ResourceKey {
        api_version: ar.api_version.clone(),
        kind: ar.kind.clone(),
        namespace,
        name,
    };
    let mut body = serde_json::to_value(&obj).ok()?;
    if let Some(root) = body.as_object_mut() {
        root.entry("apiVersion")
            .or_insert_with(|| serde_json::Value::String(ar.api_version.clone()));
        root.entry("kind")
            .or_insert_with(|| serde_json::Value::String(ar.kind.clone()));
        // server bookkeeping nobody diffs against
        if let Some(metadata) = root.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            metadata.remove("managedFields");
        }
    }
    let manifest = Manifest {
        key: key.clone(),
        body,
    };
    Some((app_id, key, manifest))
}

#[async_trait]
impl Component for KubernetesLiveStateStore {
    fn name(&self) -> &'static str {
        "kubernetes-live-state-store"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut watches = Vec::new();
        for ar in watched_resources() {
            watches.push(tokio::spawn(Self::watch_resource(
                self.shared.clone(),
                self.queue.clone(),
                self.client.clone(),
                ar,
                shutdown.clone(),
            )));
        }
        shutdown.cancelled().await;
        for watch in watches {
            if let Err(e) = watch.await {
                warn!(msg = "live-state watch panicked", err = %e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_reads_ownership_label() {
        let ar = ApiResource::erase::<Deployment>(&());
        let mut obj = DynamicObject::new("web", &ar);
        obj.metadata.namespace = Some("default".to_string());
        obj.metadata.labels = Some(
            [
                (APPLICATION_LABEL.to_string(), "app-1".to_string()),
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let (app_id, key, manifest) = convert(obj, &ar).unwrap();
        assert_eq!(app_id, "app-1");
        assert_eq!(key.kind, "Deployment");
        assert_eq!(key.namespace, "default");
        assert_eq!(manifest.body["kind"], "Deployment");
    }

    #[test]
    fn test_convert_skips_unowned_objects() {
        let ar = ApiResource::erase::<Deployment>(&());
        let obj = DynamicObject::new("web", &ar);
        assert!(convert(obj, &ar).is_none());
    }
}
