use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The agent's judgment of whether live state matches desired state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Unknown,
    Synced,
    OutOfSync,
    Deploying,
    InvalidConfig,
}

/// Per-application sync verdict produced by the drift detector.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    #[serde(default)]
    pub short_reason: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub head_deployment_id: String,
    pub timestamp: DateTime<Utc>,
}

impl SyncState {
    pub fn new(status: SyncStatus) -> Self {
        Self {
            status,
            short_reason: String::new(),
            reason: String::new(),
            head_deployment_id: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_reason(mut self, short: impl Into<String>, long: impl Into<String>) -> Self {
        self.short_reason = short.into();
        self.reason = long.into();
        self
    }

    /// Whether two states are the same observation, ignoring the timestamp.
    /// Used for edge suppression when reporting.
    pub fn same_observation(&self, other: &SyncState) -> bool {
        self.status == other.status
            && self.short_reason == other.short_reason
            && self.head_deployment_id == other.head_deployment_id
    }
}
