use crate::error::Result;
use crate::metrics::Metrics;
use crate::supervisor::Component;

use piped_api_client::rpc::ReportPipedStatsRequest;
use piped_api_client::ApiClient;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Ships a snapshot of the agent metrics to the control plane every
/// interval. Failures wait for the next tick.
pub struct StatsReporter {
    api: Arc<dyn ApiClient>,
    piped_id: String,
    metrics: Arc<Metrics>,
    interval: Duration,
}

impl StatsReporter {
    pub fn new(
        api: Arc<dyn ApiClient>,
        piped_id: impl Into<String>,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> Self {
        Self {
            api,
            piped_id: piped_id.into(),
            metrics,
            interval,
        }
    }

    async fn report(&self) {
        let encoded = match self.metrics.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(msg = "failed to encode metrics", err = %e);
                return;
            }
        };
        let request = ReportPipedStatsRequest {
            piped_id: self.piped_id.clone(),
            metrics: encoded,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.api.report_piped_stats(request).await {
            warn!(msg = "failed to report piped stats", err = %e);
        }
    }
}

#[async_trait]
impl Component for StatsReporter {
    fn name(&self) -> &'static str {
        "stats-reporter"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tick.tick() => self.report().await,
            }
        }
    }
}
