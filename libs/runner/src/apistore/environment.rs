use crate::error::Result;
use crate::supervisor::Component;

use piped_api_client::ApiClient;
use piped_model::Environment;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_ENVIRONMENT_TTL: Duration = Duration::from_secs(10 * 60);
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Pull-through cache of environments with a TTL.
///
/// Misses fetch from the control plane; a purge loop evicts expired
/// entries every minute.
#[derive(Clone)]
pub struct EnvironmentStore {
    api: Arc<dyn ApiClient>,
    ttl: Duration,
    cache: Arc<Mutex<HashMap<String, (Instant, Arc<Environment>)>>>,
}

impl EnvironmentStore {
    pub fn new(api: Arc<dyn ApiClient>, ttl: Duration) -> Self {
        Self {
            api,
            ttl,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Environment>> {
        {
            let cache = self.cache.lock().await;
            if let Some((inserted_at, environment)) = cache.get(id) {
                if inserted_at.elapsed() < self.ttl {
                    return Ok(environment.clone());
                }
            }
        }
        let environment = Arc::new(
            self.api
                .get_environment(id)
                .await
                .map_err(|e| crate::error::Error::Api("get environment".to_string(), e))?,
        );
        self.cache
            .lock()
            .await
            .insert(id.to_string(), (Instant::now(), environment.clone()));
        Ok(environment)
    }

    async fn purge_expired(&self) {
        let mut cache = self.cache.lock().await;
        let ttl = self.ttl;
        cache.retain(|_, (inserted_at, _)| inserted_at.elapsed() < ttl);
    }
}

#[async_trait]
impl Component for EnvironmentStore {
    fn name(&self) -> &'static str {
        "environment-store"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut tick = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tick.tick() => self.purge_expired().await,
            }
        }
    }
}
