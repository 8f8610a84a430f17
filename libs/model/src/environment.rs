use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A deployment environment registered on the control plane (e.g. `dev`,
/// `staging`, `prod`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}
