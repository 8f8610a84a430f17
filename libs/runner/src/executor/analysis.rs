use super::{Executor, ExecutorInput, StageOutcome};
use crate::controller::signal::StopSignal;

use piped_config::stage::{AnalysisHttp, AnalysisMetrics, AnalysisStageOptions};
use piped_config::StageOptions;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// ANALYSIS: watch metrics and probes for the configured duration and fail
/// the deployment when a provider breaches its failure limit.
///
/// Each provider is sampled on its own interval; `failure_limit`
/// consecutive bad samples fail the stage (default 1, i.e. fail on the
/// first bad sample).
pub struct AnalysisExecutor {
    http: reqwest::Client,
    state: Mutex<AnalysisState>,
}

#[derive(Default)]
struct AnalysisState {
    last_sample: HashMap<String, Instant>,
    consecutive_failures: HashMap<String, u32>,
}

impl Default for AnalysisExecutor {
    fn default() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(piped_config::DEFAULT_ANALYSIS_INTERVAL)
                .build()
                .unwrap_or_default(),
            state: Mutex::new(AnalysisState::default()),
        }
    }
}

impl AnalysisState {
    fn due(&mut self, key: &str, interval: Duration) -> bool {
        let now = Instant::now();
        match self.last_sample.get(key) {
            Some(last) if now.duration_since(*last) < interval => false,
            _ => {
                self.last_sample.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Record a sample and return the consecutive-failure count.
    fn record(&mut self, key: &str, ok: bool) -> u32 {
        if ok {
            self.consecutive_failures.insert(key.to_string(), 0);
            0
        } else {
            let count = self
                .consecutive_failures
                .entry(key.to_string())
                .or_insert(0);
            *count += 1;
            *count
        }
    }
}

#[async_trait]
impl Executor for AnalysisExecutor {
    async fn execute(&self, input: &ExecutorInput, signal: StopSignal) -> StageOutcome {
        if let Some(kind) = signal.signaled() {
            return StageOutcome::Cancelled(format!("{kind:?}"));
        }
        let options = match &input.stage_options {
            Some(StageOptions::Analysis(options)) => options.clone(),
            _ => {
                return StageOutcome::Failure(
                    "ANALYSIS stage requires analysis options".to_string(),
                );
            }
        };

        if !options.logs.is_empty() {
            return StageOutcome::Failure(
                "log analysis requires a configured log provider".to_string(),
            );
        }

        if let Some(failure) = self.sample_providers(input, &options).await {
            return StageOutcome::Failure(failure);
        }

        let elapsed = (Utc::now() - input.stage_started_at)
            .to_std()
            .unwrap_or_default();
        if elapsed >= options.duration.as_duration() {
            input.log.success("Analysis passed".to_string());
            return StageOutcome::Success;
        }
        StageOutcome::Exited
    }
}

impl AnalysisExecutor {
    async fn sample_providers(
        &self,
        input: &ExecutorInput,
        options: &AnalysisStageOptions,
    ) -> Option<String> {
        for (index, metric) in options.metrics.iter().enumerate() {
            let key = format!("metrics-{index}");
            let interval = metric
                .interval
                .map(|i| i.as_duration())
                .unwrap_or(piped_config::DEFAULT_ANALYSIS_INTERVAL);
            if !self.state.lock().due(&key, interval) {
                continue;
            }
            let ok = match self.query_metric(metric).await {
                Ok(value) => {
                    let ok = metric.expected.accepts(value);
                    if !ok {
                        input.log.error(format!(
                            "Metric {} = {value} is out of the expected range",
                            metric.query
                        ));
                    }
                    ok
                }
                Err(e) => {
                    input
                        .log
                        .error(format!("Failed to query metric {}: {e}", metric.query));
                    false
                }
            };
            let failures = self.state.lock().record(&key, ok);
            if failures >= metric.failure_limit {
                return Some(format!(
                    "metric {} breached its failure limit ({})",
                    metric.query, metric.failure_limit
                ));
            }
        }

        for (index, http) in options.https.iter().enumerate() {
            let key = format!("https-{index}");
            let interval = http
                .interval
                .map(|i| i.as_duration())
                .unwrap_or(piped_config::DEFAULT_ANALYSIS_INTERVAL);
            if !self.state.lock().due(&key, interval) {
                continue;
            }
            let ok = match self.probe_http(http).await {
                Ok(code) => {
                    let ok = code == http.expected_code;
                    if !ok {
                        input.log.error(format!(
                            "Probe {} returned {code}, expected {}",
                            http.url, http.expected_code
                        ));
                    }
                    ok
                }
                Err(e) => {
                    input.log.error(format!("Probe {} failed: {e}", http.url));
                    false
                }
            };
            let failures = self.state.lock().record(&key, ok);
            if failures >= http.failure_limit {
                return Some(format!(
                    "probe {} breached its failure limit ({})",
                    http.url, http.failure_limit
                ));
            }
        }

        None
    }

    /// Instant query against a Prometheus-compatible HTTP API.
    async fn query_metric(&self, metric: &AnalysisMetrics) -> Result<f64, String> {
        let url = format!(
            "{}/api/v1/query",
            metric.provider.trim_end_matches('/')
        );
        let response = self
            .http
            .get(url)
            .query(&[("query", metric.query.as_str())])
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }
        let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        let value = body
            .get("data")
            .and_then(|d| d.get("result"))
            .and_then(|r| r.get(0))
            .and_then(|s| s.get("value"))
            .and_then(|v| v.get(1))
            .and_then(|v| v.as_str())
            .ok_or_else(|| "empty query result".to_string())?;
        value
            .parse::<f64>()
            .map_err(|e| format!("non-numeric sample {value:?}: {e}"))
    }

    async fn probe_http(&self, probe: &AnalysisHttp) -> Result<u16, String> {
        let method = probe.method.as_deref().unwrap_or("GET");
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| format!("invalid method {method:?}"))?;
        let response = self
            .http
            .request(method, &probe.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consecutive_failures_reset_on_success() {
        let mut state = AnalysisState::default();
        assert_eq!(state.record("m", false), 1);
        assert_eq!(state.record("m", false), 2);
        assert_eq!(state.record("m", true), 0);
        assert_eq!(state.record("m", false), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_respects_interval() {
        let mut state = AnalysisState::default();
        let interval = Duration::from_secs(30);
        assert!(state.due("m", interval));
        assert!(!state.due("m", interval));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(state.due("m", interval));
    }
}
