use super::LiveStateEventQueue;
use crate::error::Result;
use crate::supervisor::Component;

use piped_api_client::rpc::ReportApplicationLiveStateEventsRequest;
use piped_api_client::ApiClient;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BATCH: usize = 200;

/// Streams live-state events from the shared queue to the control plane.
pub struct LiveStateReporter {
    api: Arc<dyn ApiClient>,
    queue: LiveStateEventQueue,
}

impl LiveStateReporter {
    pub fn new(api: Arc<dyn ApiClient>, queue: LiveStateEventQueue) -> Self {
        Self { api, queue }
    }

    async fn flush(&self) {
        while !self.queue.is_empty() {
            let events = self.queue.drain(MAX_BATCH);
            if events.is_empty() {
                return;
            }
            let count = events.len();
            let request = ReportApplicationLiveStateEventsRequest { events };
            if let Err(e) = self.api.report_application_live_state_events(request).await {
                // dropped: the queue keeps only fresh observations and the
                // next resync rebuilds the full picture
                warn!(msg = "failed to report live-state events", count, err = %e);
                return;
            }
        }
    }
}

#[async_trait]
impl Component for LiveStateReporter {
    fn name(&self) -> &'static str {
        "live-state-reporter"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut tick = tokio::time::interval(FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tick.tick() => self.flush().await,
            }
        }
    }
}
