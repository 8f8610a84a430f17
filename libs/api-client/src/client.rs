use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::rpc::*;
use crate::ApiClient;

use piped_model::{Application, Command, Deployment, Environment, Event};

use async_trait::async_trait;
use backon::Retryable;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for [`HttpApiClient`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base address of the control plane, e.g. `https://pipecd.example.com`.
    pub address: String,
    pub project_id: String,
    pub piped_id: String,
    pub piped_key: String,
    /// Allow plaintext or unverifiable TLS. Only for development setups.
    pub insecure: bool,
    /// Additional PEM root certificate.
    pub cert_file: Option<String>,
    pub retry: RetryPolicy,
}

/// HTTP/JSON implementation of [`ApiClient`].
///
/// Every operation is a `POST <address>/api/piped/v1/<Operation>` carrying
/// the piped token as a bearer credential.
pub struct HttpApiClient {
    http: reqwest::Client,
    base: Url,
    retry: RetryPolicy,
}

impl HttpApiClient {
    /// Build the client and verify the address parses. The first dial
    /// happens lazily but is bounded by the connect timeout.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let base = Url::parse(&config.address)
            .map_err(|e| Error::InvalidAddress(config.address.clone(), e))?;

        let token = format!(
            "piped-token:{}/{}/{}",
            config.project_id, config.piped_id, config.piped_key
        );
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| Error::Unauthenticated("piped key contains invalid bytes".to_string()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(DIAL_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);

        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(cert_file) = &config.cert_file {
            let pem = std::fs::read(cert_file)
                .map_err(|e| Error::ReadFile(cert_file.clone(), e))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::InvalidCertificate(cert_file.clone(), e))?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder
            .build()
            .map_err(|e| Error::Transport("failed to build http client".to_string(), e))?;

        Ok(Self {
            http,
            base,
            retry: config.retry,
        })
    }

    fn endpoint(&self, operation: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("/api/piped/v1/{operation}"));
        url
    }

    async fn call_once<Req, Res>(&self, operation: &str, req: &Req) -> Result<Res>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        let url = self.endpoint(operation);
        debug!(msg = "calling control plane", %operation);
        let response = self
            .http
            .post(url)
            .json(req)
            .send()
            .await
            .map_err(|e| Error::Transport(operation.to_string(), e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(operation.to_string()));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Unauthenticated(operation.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status(operation.to_string(), status.as_u16(), body));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(operation.to_string(), e))?;
        serde_json::from_slice(&body).map_err(|e| Error::Decode(operation.to_string(), e))
    }

    /// Call with the configured retry policy. Only used for operations
    /// that are idempotent or deduplicated server-side.
    async fn call<Req, Res>(&self, operation: &str, req: &Req) -> Result<Res>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        (|| self.call_once(operation, req))
            .retry(self.retry.backoff())
            .when(|e: &Error| e.is_retriable())
            .notify(|err, dur| {
                warn!(msg = "retrying control plane call", %operation, %err, after = ?dur);
            })
            .await
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn report_piped_meta(&self, req: ReportPipedMetaRequest) -> Result<()> {
        self.call::<_, EmptyResponse>("ReportPipedMeta", &req).await?;
        Ok(())
    }

    async fn list_applications(&self) -> Result<Vec<Application>> {
        let res: ListApplicationsResponse = self
            .call("ListApplications", &serde_json::json!({}))
            .await?;
        Ok(res.applications)
    }

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>> {
        let res: ListDeploymentsResponse = self
            .call("ListNotCompletedDeployments", &serde_json::json!({}))
            .await?;
        Ok(res.deployments)
    }

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>> {
        let res: ListCommandsResponse = self
            .call("ListUnhandledCommands", &serde_json::json!({}))
            .await?;
        Ok(res.commands)
    }

    async fn list_events(&self) -> Result<Vec<Event>> {
        let res: ListEventsResponse = self.call("ListEvents", &serde_json::json!({})).await?;
        Ok(res.events)
    }

    async fn get_latest_event(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Option<Event>> {
        let req = GetLatestEventRequest {
            name: name.to_string(),
            labels: labels.clone(),
        };
        match self
            .call::<_, GetLatestEventResponse>("GetLatestEvent", &req)
            .await
        {
            Ok(res) => Ok(res.event),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_environment(&self, id: &str) -> Result<Environment> {
        let req = GetEnvironmentRequest { id: id.to_string() };
        let res: GetEnvironmentResponse = self.call("GetEnvironment", &req).await?;
        Ok(res.environment)
    }

    async fn create_deployment(&self, deployment: Deployment) -> Result<()> {
        // idempotent: the deployment id is minted by the caller
        let req = CreateDeploymentRequest { deployment };
        self.call::<_, EmptyResponse>("CreateDeployment", &req).await?;
        Ok(())
    }

    async fn report_deployment_planned(&self, req: ReportDeploymentPlannedRequest) -> Result<()> {
        self.call::<_, EmptyResponse>("ReportDeploymentPlanned", &req)
            .await?;
        Ok(())
    }

    async fn report_deployment_status_changed(
        &self,
        req: ReportDeploymentStatusChangedRequest,
    ) -> Result<()> {
        self.call::<_, EmptyResponse>("ReportDeploymentStatusChanged", &req)
            .await?;
        Ok(())
    }

    async fn report_deployment_completed(
        &self,
        req: ReportDeploymentCompletedRequest,
    ) -> Result<()> {
        self.call::<_, EmptyResponse>("ReportDeploymentCompleted", &req)
            .await?;
        Ok(())
    }

    async fn save_deployment_metadata(&self, req: SaveDeploymentMetadataRequest) -> Result<()> {
        self.call::<_, EmptyResponse>("SaveDeploymentMetadata", &req)
            .await?;
        Ok(())
    }

    async fn report_stage_status_changed(
        &self,
        req: ReportStageStatusChangedRequest,
    ) -> Result<()> {
        self.call::<_, EmptyResponse>("ReportStageStatusChanged", &req)
            .await?;
        Ok(())
    }

    async fn save_stage_metadata(&self, req: SaveStageMetadataRequest) -> Result<()> {
        self.call::<_, EmptyResponse>("SaveStageMetadata", &req).await?;
        Ok(())
    }

    async fn report_stage_logs(&self, req: ReportStageLogsRequest) -> Result<()> {
        self.call::<_, EmptyResponse>("ReportStageLogs", &req).await?;
        Ok(())
    }

    async fn report_command_handled(&self, req: ReportCommandHandledRequest) -> Result<()> {
        self.call::<_, EmptyResponse>("ReportCommandHandled", &req)
            .await?;
        Ok(())
    }

    async fn report_application_sync_state(
        &self,
        req: ReportApplicationSyncStateRequest,
    ) -> Result<()> {
        self.call::<_, EmptyResponse>("ReportApplicationSyncState", &req)
            .await?;
        Ok(())
    }

    async fn report_application_live_state_events(
        &self,
        req: ReportApplicationLiveStateEventsRequest,
    ) -> Result<()> {
        self.call::<_, EmptyResponse>("ReportApplicationLiveStateEvents", &req)
            .await?;
        Ok(())
    }

    async fn report_piped_stats(&self, req: ReportPipedStatsRequest) -> Result<()> {
        self.call::<_, EmptyResponse>("ReportPipedStats", &req).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig {
            address: "https://pipecd.example.com".to_string(),
            project_id: "demo".to_string(),
            piped_id: "piped-1".to_string(),
            piped_key: "secret".to_string(),
            insecure: false,
            cert_file: None,
            retry: RetryPolicy::default(),
        }
    }

    #[test]
    fn test_endpoint_building() {
        let client = HttpApiClient::new(config()).unwrap();
        assert_eq!(
            client.endpoint("ReportPipedMeta").as_str(),
            "https://pipecd.example.com/api/piped/v1/ReportPipedMeta"
        );
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let mut c = config();
        c.address = "not a url".to_string();
        assert!(matches!(
            HttpApiClient::new(c),
            Err(Error::InvalidAddress(..))
        ));
    }

    #[test]
    fn test_error_retriability() {
        assert!(Error::Status("Op".to_string(), 503, String::new()).is_retriable());
        assert!(!Error::Status("Op".to_string(), 400, String::new()).is_retriable());
        assert!(!Error::NotFound("Op".to_string()).is_retriable());
    }
}
