//! Serde codec for human-readable durations in YAML (`30s`, `5m`, `6h`).

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// A duration carried in configuration, written as a humantime string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<ConfigDuration> for Duration {
    fn from(d: ConfigDuration) -> Self {
        d.0
    }
}

impl Default for ConfigDuration {
    fn default() -> Self {
        ConfigDuration::from_secs(0)
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(self.0).to_string())
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Seconds(u64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => humantime::parse_duration(&s)
                .map(ConfigDuration)
                .map_err(|e| D::Error::custom(format!("invalid duration {s:?}: {e}"))),
            Raw::Seconds(secs) => Ok(ConfigDuration(Duration::from_secs(secs))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Holder {
        value: ConfigDuration,
    }

    #[test]
    fn test_parse_text() {
        let h: Holder = serde_yaml::from_str("value: 6h").unwrap();
        assert_eq!(h.value.as_duration(), Duration::from_secs(6 * 3600));
    }

    #[test]
    fn test_parse_bare_seconds() {
        let h: Holder = serde_yaml::from_str("value: 45").unwrap();
        assert_eq!(h.value.as_duration(), Duration::from_secs(45));
    }

    #[test]
    fn test_reject_garbage() {
        assert!(serde_yaml::from_str::<Holder>("value: six hours").is_err());
    }
}
