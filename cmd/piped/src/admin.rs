//! Admin HTTP server: health, version and metrics.

use piped_runner::error::{Error, Result};
use piped_runner::metrics::Metrics;
use piped_runner::supervisor::Component;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
struct AdminState {
    version: &'static str,
    metrics: Arc<Metrics>,
}

pub struct AdminServer {
    port: u16,
    version: &'static str,
    metrics: Arc<Metrics>,
}

impl AdminServer {
    pub fn new(port: u16, version: &'static str, metrics: Arc<Metrics>) -> Self {
        Self {
            port,
            version,
            metrics,
        }
    }
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn version(State(state): State<AdminState>) -> impl IntoResponse {
    state.version
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(text) => (
            StatusCode::OK,
            [(
                "content-type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {e:?}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[async_trait]
impl Component for AdminServer {
    fn name(&self) -> &'static str {
        "admin-server"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/version", get(version))
            .route("/metrics", get(metrics))
            .with_state(AdminState {
                version: self.version,
                metrics: self.metrics.clone(),
            });

        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| Error::Io(format!("bind admin port {}", self.port), e))?;
        info!(msg = "admin server is listening", port = self.port);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| Error::Io("admin server".to_string(), e))?;
        Ok(())
    }
}
