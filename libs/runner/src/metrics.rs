use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::Arc;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PlanLabels {
    pub kind: String,
    pub strategy: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    pub stage: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StoreLabels {
    pub store: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeploymentLabels {
    pub kind: String,
    pub status: String,
}

/// Agent-wide metrics, exposed on the admin `/metrics` endpoint and shipped
/// to the control plane by the stats reporter.
pub struct Metrics {
    registry: Mutex<Registry>,
    pub deployments_triggered: Family<KindLabels, Counter>,
    pub deployments_completed: Family<DeploymentLabels, Counter>,
    pub plans_decided: Family<PlanLabels, Counter>,
    pub stages_completed: Family<StageLabels, Counter>,
    pub stage_duration_seconds: Family<StageLabels, Histogram>,
    pub store_refresh_failures: Family<StoreLabels, Counter>,
    pub applications_out_of_sync: Gauge,
    pub notifier_dropped_events: Counter,
    pub livestate_dropped_events: Counter,
    pub commands_handled: Counter,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let mut registry = Registry::with_prefix("piped");

        let deployments_triggered = Family::<KindLabels, Counter>::default();
        registry.register(
            "deployments_triggered",
            "Number of deployments created by the trigger",
            deployments_triggered.clone(),
        );

        let deployments_completed = Family::<DeploymentLabels, Counter>::default();
        registry.register(
            "deployments_completed",
            "Number of deployments that reached a terminal state",
            deployments_completed.clone(),
        );

        let plans_decided = Family::<PlanLabels, Counter>::default();
        registry.register(
            "plans_decided",
            "Number of deployment plans grouped by strategy",
            plans_decided.clone(),
        );

        let stages_completed = Family::<StageLabels, Counter>::default();
        registry.register(
            "stages_completed",
            "Number of stages that reached a terminal state",
            stages_completed.clone(),
        );

        let stage_duration_seconds =
            Family::<StageLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0, 3600.0].into_iter())
            });
        registry.register(
            "stage_duration_seconds",
            "Wall-clock duration of stage executions",
            stage_duration_seconds.clone(),
        );

        let store_refresh_failures = Family::<StoreLabels, Counter>::default();
        registry.register(
            "store_refresh_failures",
            "Number of failed store refreshes against the control plane",
            store_refresh_failures.clone(),
        );

        let applications_out_of_sync = Gauge::default();
        registry.register(
            "applications_out_of_sync",
            "Number of applications currently judged OUT_OF_SYNC",
            applications_out_of_sync.clone(),
        );

        let notifier_dropped_events = Counter::default();
        registry.register(
            "notifier_dropped_events",
            "Notification events dropped because a sink queue overflowed",
            notifier_dropped_events.clone(),
        );

        let livestate_dropped_events = Counter::default();
        registry.register(
            "livestate_dropped_events",
            "Live-state events dropped because the reporter queue overflowed",
            livestate_dropped_events.clone(),
        );

        let commands_handled = Counter::default();
        registry.register(
            "commands_handled",
            "Control-plane commands acknowledged by this agent",
            commands_handled.clone(),
        );

        Arc::new(Self {
            registry: Mutex::new(registry),
            deployments_triggered,
            deployments_completed,
            plans_decided,
            stages_completed,
            stage_duration_seconds,
            store_refresh_failures,
            applications_out_of_sync,
            notifier_dropped_events,
            livestate_dropped_events,
            commands_handled,
        })
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry.lock())?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_registered_metrics() {
        let metrics = Metrics::new();
        metrics
            .deployments_triggered
            .get_or_create(&KindLabels {
                kind: "KUBERNETES".to_string(),
            })
            .inc();
        metrics.notifier_dropped_events.inc();
        let text = metrics.encode().unwrap();
        assert!(text.contains("piped_deployments_triggered"));
        assert!(text.contains("piped_notifier_dropped_events"));
        assert!(text.contains("kind=\"KUBERNETES\""));
    }
}
