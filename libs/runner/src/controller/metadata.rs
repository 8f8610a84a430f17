use crate::error::Result;

use piped_api_client::rpc::{SaveDeploymentMetadataRequest, SaveStageMetadataRequest};
use piped_api_client::ApiClient;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Deployment- and stage-scoped metadata, mirrored to the control plane on
/// every write. Used e.g. by WAIT_APPROVAL to record the approver.
#[derive(Clone)]
pub struct MetadataStore {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn ApiClient>,
    deployment_id: String,
    shared: Mutex<HashMap<String, String>>,
    stages: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MetadataStore {
    pub fn new(api: Arc<dyn ApiClient>, deployment_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                deployment_id: deployment_id.into(),
                shared: Mutex::new(HashMap::new()),
                stages: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn seed(&self, metadata: &HashMap<String, String>) {
        self.inner.shared.lock().extend(metadata.clone());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.shared.lock().get(key).cloned()
    }

    pub fn stage_get(&self, stage_id: &str, key: &str) -> Option<String> {
        self.inner
            .stages
            .lock()
            .get(stage_id)
            .and_then(|m| m.get(key).cloned())
    }

    pub async fn save(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let metadata = {
            let mut shared = self.inner.shared.lock();
            shared.insert(key.into(), value.into());
            shared.clone()
        };
        self.inner
            .api
            .save_deployment_metadata(SaveDeploymentMetadataRequest {
                deployment_id: self.inner.deployment_id.clone(),
                metadata,
            })
            .await
            .map_err(|e| crate::error::Error::Api("save deployment metadata".to_string(), e))
    }

    pub async fn save_stage(
        &self,
        stage_id: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        let metadata = {
            let mut stages = self.inner.stages.lock();
            let stage = stages.entry(stage_id.to_string()).or_default();
            stage.insert(key.into(), value.into());
            stage.clone()
        };
        self.inner
            .api
            .save_stage_metadata(SaveStageMetadataRequest {
                deployment_id: self.inner.deployment_id.clone(),
                stage_id: stage_id.to_string(),
                metadata,
            })
            .await
            .map_err(|e| crate::error::Error::Api("save stage metadata".to_string(), e))
    }
}
