use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named event pushed to the control plane by external systems (e.g. a CI
/// job registering a new image tag) and consumed by the agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Stable identity of the (name, labels) series this event belongs to.
    pub fn event_key(&self) -> String {
        series_key(&self.name, &self.labels)
    }
}

/// Stable identity of an event series, label-order independent.
pub fn series_key(name: &str, labels: &HashMap<String, String>) -> String {
    let mut sorted: Vec<_> = labels.iter().collect();
    sorted.sort();
    let mut key = name.to_string();
    for (k, v) in sorted {
        key.push('/');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_key_is_label_order_independent() {
        let mut a = Event {
            id: "1".to_string(),
            name: "image-update".to_string(),
            data: String::new(),
            labels: HashMap::new(),
            created_at: Utc::now(),
        };
        a.labels.insert("env".to_string(), "prod".to_string());
        a.labels.insert("app".to_string(), "web".to_string());
        let mut b = a.clone();
        b.labels = HashMap::new();
        b.labels.insert("app".to_string(), "web".to_string());
        b.labels.insert("env".to_string(), "prod".to_string());
        assert_eq!(a.event_key(), b.event_key());
    }
}
