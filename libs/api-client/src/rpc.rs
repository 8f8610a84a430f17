//! Request and response bodies of the agent ↔ control-plane API.

use chrono::{DateTime, Utc};
use piped_model::{
    Application, Command, Deployment, DeploymentStatus, Environment, Event, StageStatus, SyncState,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPipedMetaRequest {
    pub version: String,
    pub repositories: Vec<PipedRepositoryMeta>,
    pub cloud_providers: Vec<PipedCloudProviderMeta>,
    pub sealed_secret_encryption: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedRepositoryMeta {
    pub repo_id: String,
    pub remote: String,
    pub branch: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedCloudProviderMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListApplicationsResponse {
    #[serde(default)]
    pub applications: Vec<Application>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDeploymentsResponse {
    #[serde(default)]
    pub deployments: Vec<Deployment>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCommandsResponse {
    #[serde(default)]
    pub commands: Vec<Command>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEventsResponse {
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLatestEventRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLatestEventResponse {
    pub event: Option<Event>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetEnvironmentRequest {
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetEnvironmentResponse {
    pub environment: Environment,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeploymentRequest {
    pub deployment: Deployment,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDeploymentPlannedRequest {
    pub deployment_id: String,
    pub summary: String,
    #[serde(default)]
    pub status_reason: String,
    pub stages: Vec<piped_model::Stage>,
    /// Commit the deployment is upgrading from, recorded at plan time.
    #[serde(default)]
    pub running_commit_hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDeploymentStatusChangedRequest {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDeploymentCompletedRequest {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_reason: String,
    pub stage_statuses: HashMap<String, StageStatus>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDeploymentMetadataRequest {
    pub deployment_id: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStageStatusChangedRequest {
    pub deployment_id: String,
    pub stage_id: String,
    pub status: StageStatus,
    #[serde(default)]
    pub status_reason: String,
    #[serde(default)]
    pub retried_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStageMetadataRequest {
    pub deployment_id: String,
    pub stage_id: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStageLogsRequest {
    pub deployment_id: String,
    pub stage_id: String,
    pub retried_count: u32,
    pub blocks: Vec<LogBlock>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBlock {
    pub index: u64,
    pub log: String,
    pub severity: LogSeverity,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSeverity {
    Info,
    Success,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCommandHandledRequest {
    pub command_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub handled_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportApplicationSyncStateRequest {
    pub application_id: String,
    pub state: SyncState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportApplicationLiveStateEventsRequest {
    pub events: Vec<LiveStateEvent>,
}

/// A change observed in the live state of a managed application.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStateEvent {
    pub application_id: String,
    pub event_type: LiveStateEventType,
    pub resource_key: piped_model::ResourceKey,
    #[serde(default)]
    pub state: Option<serde_json::Value>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiveStateEventType {
    Added,
    Updated,
    Deleted,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPipedStatsRequest {
    pub piped_id: String,
    /// Prometheus text exposition of the agent metrics.
    pub metrics: String,
    pub timestamp: DateTime<Utc>,
}

/// Responses that carry no payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EmptyResponse {}
