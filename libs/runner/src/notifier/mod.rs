//! Side-channel event egress.
//!
//! Internal components publish typed events onto a broadcast bus; the
//! notifier matches them against the configured routes and hands them to
//! sinks. Delivery is best-effort: every receiver has a bounded in-memory
//! queue that drops its oldest events on overflow and counts the drops.

use crate::apistore::EnvironmentStore;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::supervisor::Component;

use piped_config::piped::{NotificationReceiver, NotificationRoute, Notifications};
use piped_model::StageStatus;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_BUS_CAPACITY: usize = 256;
const SINK_QUEUE_CAPACITY: usize = 100;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationEvent {
    PipedStarted {
        version: String,
    },
    DeploymentTriggered {
        app_name: String,
        env_id: String,
        deployment_id: String,
        kind: String,
    },
    DeploymentPlanned {
        app_name: String,
        env_id: String,
        deployment_id: String,
        summary: String,
    },
    DeploymentSucceeded {
        app_name: String,
        env_id: String,
        deployment_id: String,
    },
    DeploymentFailed {
        app_name: String,
        env_id: String,
        deployment_id: String,
        reason: String,
    },
    DeploymentCancelled {
        app_name: String,
        env_id: String,
        deployment_id: String,
    },
    StageStarted {
        app_name: String,
        env_id: String,
        deployment_id: String,
        stage_name: String,
    },
    StageCompleted {
        app_name: String,
        env_id: String,
        deployment_id: String,
        stage_name: String,
        status: StageStatus,
    },
    ApplicationOutOfSync {
        app_name: String,
        env_id: String,
        application_id: String,
        reason: String,
    },
}

impl NotificationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NotificationEvent::PipedStarted { .. } => "PIPED_STARTED",
            NotificationEvent::DeploymentTriggered { .. } => "DEPLOYMENT_TRIGGERED",
            NotificationEvent::DeploymentPlanned { .. } => "DEPLOYMENT_PLANNED",
            NotificationEvent::DeploymentSucceeded { .. } => "DEPLOYMENT_SUCCEEDED",
            NotificationEvent::DeploymentFailed { .. } => "DEPLOYMENT_FAILED",
            NotificationEvent::DeploymentCancelled { .. } => "DEPLOYMENT_CANCELLED",
            NotificationEvent::StageStarted { .. } => "STAGE_STARTED",
            NotificationEvent::StageCompleted { .. } => "STAGE_COMPLETED",
            NotificationEvent::ApplicationOutOfSync { .. } => "APPLICATION_OUT_OF_SYNC",
        }
    }

    pub fn group(&self) -> &'static str {
        match self {
            NotificationEvent::PipedStarted { .. } => "PIPED",
            NotificationEvent::ApplicationOutOfSync { .. } => "APPLICATION",
            NotificationEvent::StageStarted { .. }
            | NotificationEvent::StageCompleted { .. } => "STAGE",
            _ => "DEPLOYMENT",
        }
    }

    pub fn app_name(&self) -> Option<&str> {
        match self {
            NotificationEvent::PipedStarted { .. } => None,
            NotificationEvent::DeploymentTriggered { app_name, .. }
            | NotificationEvent::DeploymentPlanned { app_name, .. }
            | NotificationEvent::DeploymentSucceeded { app_name, .. }
            | NotificationEvent::DeploymentFailed { app_name, .. }
            | NotificationEvent::DeploymentCancelled { app_name, .. }
            | NotificationEvent::StageStarted { app_name, .. }
            | NotificationEvent::StageCompleted { app_name, .. }
            | NotificationEvent::ApplicationOutOfSync { app_name, .. } => Some(app_name),
        }
    }

    pub fn env_id(&self) -> Option<&str> {
        match self {
            NotificationEvent::PipedStarted { .. } => None,
            NotificationEvent::DeploymentTriggered { env_id, .. }
            | NotificationEvent::DeploymentPlanned { env_id, .. }
            | NotificationEvent::DeploymentSucceeded { env_id, .. }
            | NotificationEvent::DeploymentFailed { env_id, .. }
            | NotificationEvent::DeploymentCancelled { env_id, .. }
            | NotificationEvent::StageStarted { env_id, .. }
            | NotificationEvent::StageCompleted { env_id, .. }
            | NotificationEvent::ApplicationOutOfSync { env_id, .. } => Some(env_id),
        }
    }

    /// One-line rendering for chat sinks.
    pub fn text(&self) -> String {
        match self {
            NotificationEvent::PipedStarted { version } => {
                format!("piped {version} started")
            }
            NotificationEvent::DeploymentTriggered {
                app_name,
                deployment_id,
                kind,
                ..
            } => format!("Triggered deployment {deployment_id} for {app_name} ({kind})"),
            NotificationEvent::DeploymentPlanned {
                app_name,
                deployment_id,
                summary,
                ..
            } => format!("Planned deployment {deployment_id} for {app_name}: {summary}"),
            NotificationEvent::DeploymentSucceeded {
                app_name,
                deployment_id,
                ..
            } => format!("Deployment {deployment_id} for {app_name} succeeded"),
            NotificationEvent::DeploymentFailed {
                app_name,
                deployment_id,
                reason,
                ..
            } => format!("Deployment {deployment_id} for {app_name} failed: {reason}"),
            NotificationEvent::DeploymentCancelled {
                app_name,
                deployment_id,
                ..
            } => format!("Deployment {deployment_id} for {app_name} was cancelled"),
            NotificationEvent::StageStarted {
                app_name,
                stage_name,
                ..
            } => format!("Stage {stage_name} started for {app_name}"),
            NotificationEvent::StageCompleted {
                app_name,
                stage_name,
                status,
                ..
            } => format!("Stage {stage_name} for {app_name} finished: {status:?}"),
            NotificationEvent::ApplicationOutOfSync {
                app_name, reason, ..
            } => format!("{app_name} is out of sync: {reason}"),
        }
    }
}

/// Producer side of the event bus, cloned into every component.
#[derive(Clone)]
pub struct NotifierHandle {
    tx: broadcast::Sender<NotificationEvent>,
}

impl NotifierHandle {
    pub fn publish(&self, event: NotificationEvent) {
        // no receivers is fine: the notifier may be disabled
        let _ = self.tx.send(event);
    }
}

/// Whether a route matches an event. `env_name` is the resolved name of
/// the event's environment, when known.
pub fn route_matches(
    route: &NotificationRoute,
    event: &NotificationEvent,
    env_name: Option<&str>,
) -> bool {
    if !route.events.is_empty() && !route.events.iter().any(|e| e == event.name()) {
        return false;
    }
    if !route.groups.is_empty() && !route.groups.iter().any(|g| g == event.group()) {
        return false;
    }
    if !route.apps.is_empty() {
        match event.app_name() {
            Some(app) if route.apps.iter().any(|a| a == app) => {}
            _ => return false,
        }
    }
    if !route.envs.is_empty() {
        match env_name {
            Some(env) if route.envs.iter().any(|e| e == env) => {}
            _ => return false,
        }
    }
    true
}

struct SinkQueue {
    receiver: NotificationReceiver,
    queue: Mutex<VecDeque<NotificationEvent>>,
    wakeup: Notify,
}

impl SinkQueue {
    fn push(&self, event: NotificationEvent, metrics: &Metrics) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= SINK_QUEUE_CAPACITY {
                queue.pop_front();
                metrics.notifier_dropped_events.inc();
            }
            queue.push_back(event);
        }
        self.wakeup.notify_one();
    }

    fn pop(&self) -> Option<NotificationEvent> {
        self.queue.lock().pop_front()
    }
}

pub struct Notifier {
    config: Notifications,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
    rx: broadcast::Receiver<NotificationEvent>,
    handle: NotifierHandle,
    environments: Option<EnvironmentStore>,
}

impl Notifier {
    pub fn new(config: Notifications, metrics: Arc<Metrics>) -> Self {
        let (tx, rx) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            config,
            metrics,
            http: reqwest::Client::new(),
            rx,
            handle: NotifierHandle { tx },
            environments: None,
        }
    }

    /// Enable environment-name matching for routes using `envs`.
    pub fn with_environments(mut self, environments: EnvironmentStore) -> Self {
        self.environments = Some(environments);
        self
    }

    pub fn handle(&self) -> NotifierHandle {
        self.handle.clone()
    }

    async fn deliver(&self, sink: &SinkQueue) {
        while let Some(event) = sink.pop() {
            if let Some(webhook) = &sink.receiver.webhook {
                let result = self.http.post(&webhook.url).json(&event).send().await;
                if let Err(e) = result {
                    warn!(msg = "webhook notification failed", url = %webhook.url, err = %e);
                }
            }
            if let Some(slack) = &sink.receiver.slack {
                let payload = serde_json::json!({ "text": event.text() });
                let result = self.http.post(&slack.hook_url).json(&payload).send().await;
                if let Err(e) = result {
                    warn!(msg = "slack notification failed", err = %e);
                }
            }
        }
    }
}

#[async_trait]
impl Component for Notifier {
    fn name(&self) -> &'static str {
        "notifier"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let sinks: Vec<Arc<SinkQueue>> = self
            .config
            .receivers
            .iter()
            .map(|receiver| {
                Arc::new(SinkQueue {
                    receiver: receiver.clone(),
                    queue: Mutex::new(VecDeque::new()),
                    wakeup: Notify::new(),
                })
            })
            .collect();

        let mut rx = self.rx.resubscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                received = rx.recv() => {
                    let event = match received {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(msg = "notifier lagged behind the event bus", skipped = n);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    };
                    debug!(msg = "notification event", name = event.name());
                    let needs_env = self.config.routes.iter().any(|r| !r.envs.is_empty());
                    let env_name = match (&self.environments, event.env_id()) {
                        (Some(environments), Some(env_id)) if needs_env => environments
                            .get(env_id)
                            .await
                            .ok()
                            .map(|e| e.name.clone()),
                        _ => None,
                    };
                    for route in &self.config.routes {
                        if !route_matches(route, &event, env_name.as_deref()) {
                            continue;
                        }
                        if let Some(sink) = sinks
                            .iter()
                            .find(|s| s.receiver.name == route.receiver)
                        {
                            sink.push(event.clone(), &self.metrics);
                        }
                    }
                    // drain matched sinks inline; delivery is best-effort
                    for sink in &sinks {
                        self.deliver(sink).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(events: &[&str], apps: &[&str]) -> NotificationRoute {
        NotificationRoute {
            name: "r".to_string(),
            receiver: "sink".to_string(),
            events: events.iter().map(|s| s.to_string()).collect(),
            groups: Vec::new(),
            apps: apps.iter().map(|s| s.to_string()).collect(),
            envs: Vec::new(),
        }
    }

    fn triggered(app: &str) -> NotificationEvent {
        NotificationEvent::DeploymentTriggered {
            app_name: app.to_string(),
            env_id: "env-1".to_string(),
            deployment_id: "d-1".to_string(),
            kind: "KUBERNETES".to_string(),
        }
    }

    #[test]
    fn test_route_matching() {
        assert!(route_matches(&route(&[], &[]), &triggered("web"), None));
        assert!(route_matches(
            &route(&["DEPLOYMENT_TRIGGERED"], &[]),
            &triggered("web"),
            None
        ));
        assert!(!route_matches(
            &route(&["DEPLOYMENT_FAILED"], &[]),
            &triggered("web"),
            None
        ));
        assert!(route_matches(&route(&[], &["web"]), &triggered("web"), None));
        assert!(!route_matches(
            &route(&[], &["other"]),
            &triggered("web"),
            None
        ));
    }

    #[test]
    fn test_route_matching_by_environment() {
        let mut r = route(&[], &[]);
        r.envs = vec!["prod".to_string()];
        assert!(route_matches(&r, &triggered("web"), Some("prod")));
        assert!(!route_matches(&r, &triggered("web"), Some("dev")));
        assert!(!route_matches(&r, &triggered("web"), None));
    }

    #[test]
    fn test_sink_queue_drops_oldest_on_overflow() {
        let metrics = Metrics::new();
        let sink = SinkQueue {
            receiver: NotificationReceiver::default(),
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
        };
        for i in 0..(SINK_QUEUE_CAPACITY + 3) {
            sink.push(triggered(&format!("app-{i}")), &metrics);
        }
        assert_eq!(sink.queue.lock().len(), SINK_QUEUE_CAPACITY);
        // the oldest three were dropped
        match sink.pop().unwrap() {
            NotificationEvent::DeploymentTriggered { app_name, .. } => {
                assert_eq!(app_name, "app-3")
            }
            other => panic!("unexpected event {other:?}"),
        }
        let text = metrics.encode().unwrap();
        assert!(text.contains("piped_notifier_dropped_events_total 3"));
    }
}
