//! Authenticated client for the control-plane API.
//!
//! The trait is the seam the rest of the agent programs against; the HTTP
//! implementation lives in [`client`]. All unary calls are idempotent or
//! carry a caller-supplied stable id, so retrying is always safe.

pub mod client;
pub mod error;
pub mod retry;
pub mod rpc;

pub use client::{ClientConfig, HttpApiClient};
pub use error::{Error, Result};
pub use retry::RetryPolicy;

use piped_model::{Application, Command, Deployment, Environment, Event};

use async_trait::async_trait;
use std::collections::HashMap;

/// Operations the agent performs against the control plane.
#[async_trait]
pub trait ApiClient: Send + Sync + 'static {
    async fn report_piped_meta(&self, req: rpc::ReportPipedMetaRequest) -> Result<()>;

    async fn list_applications(&self) -> Result<Vec<Application>>;

    /// Deployments owned by this piped that have not reached a terminal
    /// state yet.
    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>>;

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>>;

    async fn list_events(&self) -> Result<Vec<Event>>;

    async fn get_latest_event(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Option<Event>>;

    async fn get_environment(&self, id: &str) -> Result<Environment>;

    async fn create_deployment(&self, deployment: Deployment) -> Result<()>;

    async fn report_deployment_planned(
        &self,
        req: rpc::ReportDeploymentPlannedRequest,
    ) -> Result<()>;

    async fn report_deployment_status_changed(
        &self,
        req: rpc::ReportDeploymentStatusChangedRequest,
    ) -> Result<()>;

    async fn report_deployment_completed(
        &self,
        req: rpc::ReportDeploymentCompletedRequest,
    ) -> Result<()>;

    async fn save_deployment_metadata(
        &self,
        req: rpc::SaveDeploymentMetadataRequest,
    ) -> Result<()>;

    async fn report_stage_status_changed(
        &self,
        req: rpc::ReportStageStatusChangedRequest,
    ) -> Result<()>;

    async fn save_stage_metadata(&self, req: rpc::SaveStageMetadataRequest) -> Result<()>;

    async fn report_stage_logs(&self, req: rpc::ReportStageLogsRequest) -> Result<()>;

    async fn report_command_handled(&self, req: rpc::ReportCommandHandledRequest) -> Result<()>;

    async fn report_application_sync_state(
        &self,
        req: rpc::ReportApplicationSyncStateRequest,
    ) -> Result<()>;

    async fn report_application_live_state_events(
        &self,
        req: rpc::ReportApplicationLiveStateEventsRequest,
    ) -> Result<()>;

    async fn report_piped_stats(&self, req: rpc::ReportPipedStatsRequest) -> Result<()>;
}
