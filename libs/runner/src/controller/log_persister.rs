//! Local-first stage logs.
//!
//! Executor output is captured in memory first and streamed to the control
//! plane in blocks, so a reporter outage never loses user-visible output;
//! unsent blocks stay buffered and go out with the next flush.

use piped_api_client::rpc::{LogBlock, LogSeverity, ReportStageLogsRequest};
use piped_api_client::ApiClient;

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct StageLogPersister {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn ApiClient>,
    deployment_id: String,
    stage_id: String,
    retried_count: u32,
    next_index: AtomicU64,
    unsent: Mutex<Vec<LogBlock>>,
}

impl StageLogPersister {
    pub fn new(
        api: Arc<dyn ApiClient>,
        deployment_id: impl Into<String>,
        stage_id: impl Into<String>,
        retried_count: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                deployment_id: deployment_id.into(),
                stage_id: stage_id.into(),
                retried_count,
                next_index: AtomicU64::new(0),
                unsent: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn info(&self, log: impl Into<String>) {
        self.append(log.into(), LogSeverity::Info);
    }

    pub fn success(&self, log: impl Into<String>) {
        self.append(log.into(), LogSeverity::Success);
    }

    pub fn error(&self, log: impl Into<String>) {
        self.append(log.into(), LogSeverity::Error);
    }

    fn append(&self, log: String, severity: LogSeverity) {
        let index = self.inner.next_index.fetch_add(1, Ordering::SeqCst);
        self.inner.unsent.lock().push(LogBlock {
            index,
            log,
            severity,
            created_at: Utc::now(),
        });
    }

    /// Ship buffered blocks. On failure the blocks are kept for the next
    /// flush; ordering is preserved.
    pub async fn flush(&self) {
        let blocks: Vec<LogBlock> = {
            let mut unsent = self.inner.unsent.lock();
            std::mem::take(&mut *unsent)
        };
        if blocks.is_empty() {
            return;
        }
        let request = ReportStageLogsRequest {
            deployment_id: self.inner.deployment_id.clone(),
            stage_id: self.inner.stage_id.clone(),
            retried_count: self.inner.retried_count,
            blocks: blocks.clone(),
        };
        if let Err(e) = self.inner.api.report_stage_logs(request).await {
            warn!(
                msg = "failed to report stage logs, will retry on next flush",
                deployment = %self.inner.deployment_id,
                stage = %self.inner.stage_id,
                err = %e,
            );
            let mut unsent = self.inner.unsent.lock();
            let mut restored = blocks;
            restored.append(&mut unsent);
            *unsent = restored;
        }
    }
}
