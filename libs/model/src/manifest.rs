use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to parse manifest: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("manifest is missing {0}")]
    MissingField(&'static str),
}

/// Stable identity of a cloud-provider artifact.
///
/// Equality uses the full key; ordering is undefined by contract.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    /// API group including the version, e.g. `apps/v1`. Empty for providers
    /// without a group concept.
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}:{}:{}", self.api_version, self.kind, self.name)
        } else {
            write!(
                f,
                "{}:{}:{}:{}",
                self.api_version, self.kind, self.namespace, self.name
            )
        }
    }
}

/// A normalized representation of a cloud-provider artifact.
///
/// The body is kept as a JSON value so diffing and field scoping work the
/// same across providers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub key: ResourceKey,
    pub body: Value,
}

impl Manifest {
    /// Build a manifest from a parsed object, reading the identity fields
    /// from the body.
    pub fn from_value(body: Value) -> Result<Self, ManifestError> {
        let api_version = body
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or(ManifestError::MissingField("apiVersion"))?
            .to_string();
        let kind = body
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(ManifestError::MissingField("kind"))?
            .to_string();
        let metadata = body
            .get("metadata")
            .ok_or(ManifestError::MissingField("metadata"))?;
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .ok_or(ManifestError::MissingField("metadata.name"))?
            .to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            key: ResourceKey {
                api_version,
                kind,
                namespace,
                name,
            },
            body,
        })
    }

    /// Parse a multi-document YAML string into manifests, skipping empty
    /// documents.
    pub fn from_yaml_multi(data: &str) -> Result<Vec<Self>, ManifestError> {
        let mut manifests = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(data) {
            let value: serde_yaml::Value =
                serde_yaml::Value::deserialize(doc).map_err(ManifestError::Parse)?;
            if value.is_null() {
                continue;
            }
            let json = serde_json::to_value(&value)
                .map_err(|_| ManifestError::MissingField("convertible document"))?;
            manifests.push(Self::from_value(json)?);
        }
        Ok(manifests)
    }

    /// Read a nested field by slash-separated path, e.g. `spec/replicas`.
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut current = &self.body;
        for part in path.split('/') {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Set an annotation, creating `metadata.annotations` when absent.
    pub fn add_annotation(&mut self, key: &str, value: &str) {
        let metadata = self
            .body
            .as_object_mut()
            .expect("manifest body is an object")
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(meta) = metadata.as_object_mut() {
            let annotations = meta
                .entry("annotations")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(map) = annotations.as_object_mut() {
                map.insert(key.to_string(), Value::String(value.to_string()));
            }
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.body
            .get("metadata")?
            .get("annotations")?
            .get(key)?
            .as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_DOCS: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: default
spec:
  replicas: 3
---
apiVersion: v1
kind: Service
metadata:
  name: web
"#;

    #[test]
    fn test_from_yaml_multi() {
        let manifests = Manifest::from_yaml_multi(TWO_DOCS).unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].key.kind, "Deployment");
        assert_eq!(manifests[0].key.namespace, "default");
        assert_eq!(manifests[1].key.kind, "Service");
        assert_eq!(manifests[1].key.namespace, "");
    }

    #[test]
    fn test_field_lookup() {
        let manifests = Manifest::from_yaml_multi(TWO_DOCS).unwrap();
        assert_eq!(
            manifests[0].field("spec/replicas"),
            Some(&Value::from(3u64))
        );
        assert!(manifests[0].field("spec/template").is_none());
    }

    #[test]
    fn test_annotation_roundtrip() {
        let mut manifest = Manifest::from_yaml_multi(TWO_DOCS).unwrap().remove(0);
        manifest.add_annotation("piped.dev/application", "app-1");
        assert_eq!(manifest.annotation("piped.dev/application"), Some("app-1"));
    }

    #[test]
    fn test_missing_identity_is_an_error() {
        let err = Manifest::from_yaml_multi("kind: Deployment\nmetadata:\n  name: x\n");
        assert!(err.is_err());
    }
}
