//! Configuration files used by the agent.
//!
//! Every file carries an envelope `{apiVersion, kind, spec}`; the spec is
//! decoded against the type selected by `kind`. Unknown kinds are rejected.

pub mod app;
pub mod duration;
pub mod piped;
pub mod stage;

pub use app::{
    CloudRunAppSpec, CommitMatcher, EcsAppSpec, GenericAppSpec, KubernetesAppSpec, LambdaAppSpec,
    Pipeline, TerraformAppSpec,
};
pub use duration::ConfigDuration;
pub use piped::PipedSpec;
pub use stage::{PipelineStage, StageOptions};

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const API_VERSION: &str = "piped.dev/v1beta1";

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_DEPLOYMENT_TIMEOUT: Duration = Duration::from_secs(6 * 3600);
pub const DEFAULT_WAIT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(6 * 3600);
pub const DEFAULT_ANALYSIS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read {0}: {1}")]
    Read(String, #[source] std::io::Error),

    #[error("failed to decode configuration: {0}")]
    Decode(#[source] serde_yaml::Error),

    #[error("unsupported apiVersion {0:?}, expected {API_VERSION:?}")]
    UnsupportedApiVersion(String),

    #[error("unknown configuration kind {0:?}")]
    UnknownKind(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A decoded configuration file.
#[derive(Clone, Debug)]
pub enum Config {
    Piped(Box<PipedSpec>),
    KubernetesApp(Box<KubernetesAppSpec>),
    TerraformApp(Box<TerraformAppSpec>),
    CloudRunApp(Box<CloudRunAppSpec>),
    LambdaApp(Box<LambdaAppSpec>),
    EcsApp(Box<EcsAppSpec>),
}

impl Config {
    pub fn kind(&self) -> &'static str {
        match self {
            Config::Piped(_) => "Piped",
            Config::KubernetesApp(_) => "KubernetesApp",
            Config::TerraformApp(_) => "TerraformApp",
            Config::CloudRunApp(_) => "CloudRunApp",
            Config::LambdaApp(_) => "LambdaApp",
            Config::EcsApp(_) => "EcsApp",
        }
    }

    /// The kind-independent part of an application spec. None for `Piped`.
    pub fn generic(&self) -> Option<&GenericAppSpec> {
        match self {
            Config::Piped(_) => None,
            Config::KubernetesApp(s) => Some(&s.generic),
            Config::TerraformApp(s) => Some(&s.generic),
            Config::CloudRunApp(s) => Some(&s.generic),
            Config::LambdaApp(s) => Some(&s.generic),
            Config::EcsApp(s) => Some(&s.generic),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    api_version: String,
    kind: String,
    #[serde(default)]
    spec: serde_yaml::Value,
}

/// Decode a configuration document from YAML text.
pub fn parse(data: &str) -> Result<Config> {
    let envelope: Envelope = serde_yaml::from_str(data).map_err(Error::Decode)?;
    if envelope.api_version != API_VERSION {
        return Err(Error::UnsupportedApiVersion(envelope.api_version));
    }
    // a missing spec means "all defaults" for the kinds that allow it
    let spec = match envelope.spec {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(Default::default()),
        other => other,
    };
    let config = match envelope.kind.as_str() {
        "Piped" => {
            let spec: PipedSpec = serde_yaml::from_value(spec).map_err(Error::Decode)?;
            spec.validate().map_err(Error::Invalid)?;
            Config::Piped(Box::new(spec))
        }
        "KubernetesApp" => {
            let spec: KubernetesAppSpec = serde_yaml::from_value(spec).map_err(Error::Decode)?;
            spec.generic.validate().map_err(Error::Invalid)?;
            Config::KubernetesApp(Box::new(spec))
        }
        "TerraformApp" => {
            let spec: TerraformAppSpec = serde_yaml::from_value(spec).map_err(Error::Decode)?;
            spec.generic.validate().map_err(Error::Invalid)?;
            Config::TerraformApp(Box::new(spec))
        }
        "CloudRunApp" => {
            let spec: CloudRunAppSpec = serde_yaml::from_value(spec).map_err(Error::Decode)?;
            spec.generic.validate().map_err(Error::Invalid)?;
            Config::CloudRunApp(Box::new(spec))
        }
        "LambdaApp" => {
            let spec: LambdaAppSpec = serde_yaml::from_value(spec).map_err(Error::Decode)?;
            spec.generic.validate().map_err(Error::Invalid)?;
            Config::LambdaApp(Box::new(spec))
        }
        "EcsApp" => {
            let spec: EcsAppSpec = serde_yaml::from_value(spec).map_err(Error::Decode)?;
            spec.generic.validate().map_err(Error::Invalid)?;
            Config::EcsApp(Box::new(spec))
        }
        other => return Err(Error::UnknownKind(other.to_string())),
    };
    Ok(config)
}

/// Read and decode a configuration file.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::Read(path.display().to_string(), e))?;
    parse(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kubernetes_app_envelope() {
        let config = parse(
            r#"
apiVersion: piped.dev/v1beta1
kind: KubernetesApp
spec:
  input:
    manifests: ["deployment.yaml"]
"#,
        )
        .unwrap();
        assert_eq!(config.kind(), "KubernetesApp");
        assert!(config.generic().is_some());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = parse("apiVersion: piped.dev/v1beta1\nkind: ControlPlane\nspec: {}\n")
            .unwrap_err();
        assert!(matches!(err, Error::UnknownKind(k) if k == "ControlPlane"));
    }

    #[test]
    fn test_unsupported_api_version_is_rejected() {
        let err = parse("apiVersion: piped.dev/v2\nkind: Piped\nspec: {}\n").unwrap_err();
        assert!(matches!(err, Error::UnsupportedApiVersion(_)));
    }

    #[test]
    fn test_empty_spec_defaults_for_app_kinds() {
        let config = parse("apiVersion: piped.dev/v1beta1\nkind: LambdaApp\n").unwrap();
        match config {
            Config::LambdaApp(spec) => {
                assert_eq!(spec.input.function_manifest_file, "function.yaml")
            }
            other => panic!("unexpected config: {}", other.kind()),
        }
    }
}
