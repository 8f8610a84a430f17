//! Pipeline stage configuration.
//!
//! A stage is written as an envelope `{id, name, desc, timeout, with}`
//! where `with` is the stage-specific options object. Decoding happens in
//! two passes: the envelope first, then `with` against the variant chosen
//! by `name`. An unknown `name` is a configuration error.

use crate::duration::ConfigDuration;

use piped_model::StageName;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Count-or-percentage replica setting used by canary/baseline rollouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Replicas {
    pub number: u32,
    pub is_percentage: bool,
}

impl Default for Replicas {
    fn default() -> Self {
        Self {
            number: 1,
            is_percentage: false,
        }
    }
}

impl Replicas {
    /// Resolve against the primary replica count.
    pub fn calculate(&self, primary: u32) -> u32 {
        if self.is_percentage {
            ((primary as f64) * (self.number as f64) / 100.0).ceil() as u32
        } else {
            self.number
        }
    }
}

impl<'de> Deserialize<'de> for Replicas {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u32),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Replicas {
                number: n,
                is_percentage: false,
            }),
            Raw::Text(s) => {
                let (digits, is_percentage) = match s.strip_suffix('%') {
                    Some(d) => (d, true),
                    None => (s.as_str(), false),
                };
                let number = digits
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| D::Error::custom(format!("invalid replicas value {s:?}")))?;
                Ok(Replicas {
                    number,
                    is_percentage,
                })
            }
        }
    }
}

impl Serialize for Replicas {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_percentage {
            serializer.serialize_str(&format!("{}%", self.number))
        } else {
            serializer.serialize_u32(self.number)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WaitStageOptions {
    pub duration: ConfigDuration,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WaitApprovalStageOptions {
    #[serde(default)]
    pub timeout: Option<ConfigDuration>,
    #[serde(default)]
    pub approvers: Vec<String>,
}

impl WaitApprovalStageOptions {
    pub fn timeout(&self) -> std::time::Duration {
        self.timeout
            .map(|t| t.as_duration())
            .unwrap_or(crate::DEFAULT_WAIT_APPROVAL_TIMEOUT)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnalysisStageOptions {
    pub duration: ConfigDuration,
    #[serde(default)]
    pub metrics: Vec<AnalysisMetrics>,
    #[serde(default)]
    pub logs: Vec<AnalysisLog>,
    #[serde(default)]
    pub https: Vec<AnalysisHttp>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnalysisMetrics {
    /// Base URL of the metrics provider (Prometheus HTTP API).
    pub provider: String,
    pub query: String,
    pub expected: AnalysisExpected,
    #[serde(default)]
    pub interval: Option<ConfigDuration>,
    /// Number of consecutive bad samples before the stage fails.
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
}

fn default_failure_limit() -> u32 {
    1
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnalysisExpected {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl AnalysisExpected {
    pub fn accepts(&self, value: f64) -> bool {
        if let Some(min) = self.min {
            if value < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnalysisLog {
    pub provider: String,
    pub query: String,
    #[serde(default)]
    pub interval: Option<ConfigDuration>,
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnalysisHttp {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default = "default_expected_code")]
    pub expected_code: u16,
    #[serde(default)]
    pub interval: Option<ConfigDuration>,
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
}

fn default_expected_code() -> u16 {
    200
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct K8sSyncStageOptions {
    #[serde(default)]
    pub prune: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct K8sPrimaryRolloutStageOptions {
    #[serde(default)]
    pub add_variant_label_to_selector: bool,
    #[serde(default)]
    pub prune: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct K8sCanaryRolloutStageOptions {
    #[serde(default)]
    pub replicas: Replicas,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct K8sCanaryCleanStageOptions {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct K8sBaselineRolloutStageOptions {
    #[serde(default)]
    pub replicas: Replicas,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct K8sBaselineCleanStageOptions {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct K8sTrafficRoutingStageOptions {
    /// Route all traffic to one variant: `primary`, `canary` or `baseline`.
    #[serde(default)]
    pub all: Option<String>,
    #[serde(default)]
    pub primary: Option<u32>,
    #[serde(default)]
    pub canary: Option<u32>,
    #[serde(default)]
    pub baseline: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TerraformSyncStageOptions {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TerraformPlanStageOptions {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TerraformApplyStageOptions {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CloudRunSyncStageOptions {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CloudRunPromoteStageOptions {
    /// Percent of traffic shifted to the new revision.
    #[serde(default)]
    pub percent: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LambdaSyncStageOptions {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LambdaPromoteStageOptions {
    #[serde(default)]
    pub percent: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EcsSyncStageOptions {}

/// Stage options selected by the stage name.
#[derive(Clone, Debug, PartialEq)]
pub enum StageOptions {
    Wait(WaitStageOptions),
    WaitApproval(WaitApprovalStageOptions),
    Analysis(AnalysisStageOptions),
    K8sSync(K8sSyncStageOptions),
    K8sPrimaryRollout(K8sPrimaryRolloutStageOptions),
    K8sCanaryRollout(K8sCanaryRolloutStageOptions),
    K8sCanaryClean(K8sCanaryCleanStageOptions),
    K8sBaselineRollout(K8sBaselineRolloutStageOptions),
    K8sBaselineClean(K8sBaselineCleanStageOptions),
    K8sTrafficRouting(K8sTrafficRoutingStageOptions),
    TerraformSync(TerraformSyncStageOptions),
    TerraformPlan(TerraformPlanStageOptions),
    TerraformApply(TerraformApplyStageOptions),
    CloudRunSync(CloudRunSyncStageOptions),
    CloudRunPromote(CloudRunPromoteStageOptions),
    LambdaSync(LambdaSyncStageOptions),
    LambdaPromote(LambdaPromoteStageOptions),
    EcsSync(EcsSyncStageOptions),
}

impl StageOptions {
    pub fn stage_name(&self) -> StageName {
        match self {
            StageOptions::Wait(_) => StageName::Wait,
            StageOptions::WaitApproval(_) => StageName::WaitApproval,
            StageOptions::Analysis(_) => StageName::Analysis,
            StageOptions::K8sSync(_) => StageName::K8sSync,
            StageOptions::K8sPrimaryRollout(_) => StageName::K8sPrimaryRollout,
            StageOptions::K8sCanaryRollout(_) => StageName::K8sCanaryRollout,
            StageOptions::K8sCanaryClean(_) => StageName::K8sCanaryClean,
            StageOptions::K8sBaselineRollout(_) => StageName::K8sBaselineRollout,
            StageOptions::K8sBaselineClean(_) => StageName::K8sBaselineClean,
            StageOptions::K8sTrafficRouting(_) => StageName::K8sTrafficRouting,
            StageOptions::TerraformSync(_) => StageName::TerraformSync,
            StageOptions::TerraformPlan(_) => StageName::TerraformPlan,
            StageOptions::TerraformApply(_) => StageName::TerraformApply,
            StageOptions::CloudRunSync(_) => StageName::CloudRunSync,
            StageOptions::CloudRunPromote(_) => StageName::CloudRunPromote,
            StageOptions::LambdaSync(_) => StageName::LambdaSync,
            StageOptions::LambdaPromote(_) => StageName::LambdaPromote,
            StageOptions::EcsSync(_) => StageName::EcsSync,
        }
    }
}

/// One configured stage of a deployment pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineStage {
    pub id: Option<String>,
    pub name: StageName,
    pub desc: Option<String>,
    pub timeout: Option<ConfigDuration>,
    pub options: StageOptions,
}

impl<'de> Deserialize<'de> for PipelineStage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Envelope {
            #[serde(default)]
            id: Option<String>,
            name: String,
            #[serde(default)]
            desc: Option<String>,
            #[serde(default)]
            timeout: Option<ConfigDuration>,
            #[serde(default = "empty_mapping")]
            with: serde_yaml::Value,
        }

        fn empty_mapping() -> serde_yaml::Value {
            serde_yaml::Value::Mapping(Default::default())
        }

        fn opts<'de, D, T>(with: serde_yaml::Value) -> Result<T, D::Error>
        where
            D: Deserializer<'de>,
            T: serde::de::DeserializeOwned,
        {
            serde_yaml::from_value(with)
                .map_err(|e| D::Error::custom(format!("invalid stage options: {e}")))
        }

        let envelope = Envelope::deserialize(deserializer)?;
        let name: StageName =
            serde_yaml::from_value(serde_yaml::Value::String(envelope.name.clone()))
                .map_err(|_| D::Error::custom(format!("unknown stage name {:?}", envelope.name)))?;
        let with = match envelope.with {
            serde_yaml::Value::Null => empty_mapping(),
            other => other,
        };
        let options = match name {
            StageName::Wait => StageOptions::Wait(opts::<D, _>(with)?),
            StageName::WaitApproval => StageOptions::WaitApproval(opts::<D, _>(with)?),
            StageName::Analysis => StageOptions::Analysis(opts::<D, _>(with)?),
            StageName::K8sSync => StageOptions::K8sSync(opts::<D, _>(with)?),
            StageName::K8sPrimaryRollout => StageOptions::K8sPrimaryRollout(opts::<D, _>(with)?),
            StageName::K8sCanaryRollout => StageOptions::K8sCanaryRollout(opts::<D, _>(with)?),
            StageName::K8sCanaryClean => StageOptions::K8sCanaryClean(opts::<D, _>(with)?),
            StageName::K8sBaselineRollout => {
                StageOptions::K8sBaselineRollout(opts::<D, _>(with)?)
            }
            StageName::K8sBaselineClean => StageOptions::K8sBaselineClean(opts::<D, _>(with)?),
            StageName::K8sTrafficRouting => StageOptions::K8sTrafficRouting(opts::<D, _>(with)?),
            StageName::TerraformSync => StageOptions::TerraformSync(opts::<D, _>(with)?),
            StageName::TerraformPlan => StageOptions::TerraformPlan(opts::<D, _>(with)?),
            StageName::TerraformApply => StageOptions::TerraformApply(opts::<D, _>(with)?),
            StageName::CloudRunSync => StageOptions::CloudRunSync(opts::<D, _>(with)?),
            StageName::CloudRunPromote => StageOptions::CloudRunPromote(opts::<D, _>(with)?),
            StageName::LambdaSync => StageOptions::LambdaSync(opts::<D, _>(with)?),
            StageName::LambdaPromote => StageOptions::LambdaPromote(opts::<D, _>(with)?),
            StageName::EcsSync => StageOptions::EcsSync(opts::<D, _>(with)?),
            StageName::Rollback => {
                return Err(D::Error::custom(
                    "ROLLBACK cannot be configured directly; it is prepared by the planner",
                ));
            }
        };
        Ok(PipelineStage {
            id: envelope.id,
            name,
            desc: envelope.desc,
            timeout: envelope.timeout,
            options,
        })
    }
}

impl Serialize for PipelineStage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        if let Some(id) = &self.id {
            map.serialize_entry("id", id)?;
        }
        map.serialize_entry("name", &self.name)?;
        if let Some(desc) = &self.desc {
            map.serialize_entry("desc", desc)?;
        }
        if let Some(timeout) = &self.timeout {
            map.serialize_entry("timeout", timeout)?;
        }
        match &self.options {
            StageOptions::Wait(o) => map.serialize_entry("with", o)?,
            StageOptions::WaitApproval(o) => map.serialize_entry("with", o)?,
            StageOptions::Analysis(o) => map.serialize_entry("with", o)?,
            StageOptions::K8sSync(o) => map.serialize_entry("with", o)?,
            StageOptions::K8sPrimaryRollout(o) => map.serialize_entry("with", o)?,
            StageOptions::K8sCanaryRollout(o) => map.serialize_entry("with", o)?,
            StageOptions::K8sCanaryClean(o) => map.serialize_entry("with", o)?,
            StageOptions::K8sBaselineRollout(o) => map.serialize_entry("with", o)?,
            StageOptions::K8sBaselineClean(o) => map.serialize_entry("with", o)?,
            StageOptions::K8sTrafficRouting(o) => map.serialize_entry("with", o)?,
            StageOptions::TerraformSync(o) => map.serialize_entry("with", o)?,
            StageOptions::TerraformPlan(o) => map.serialize_entry("with", o)?,
            StageOptions::TerraformApply(o) => map.serialize_entry("with", o)?,
            StageOptions::CloudRunSync(o) => map.serialize_entry("with", o)?,
            StageOptions::CloudRunPromote(o) => map.serialize_entry("with", o)?,
            StageOptions::LambdaSync(o) => map.serialize_entry("with", o)?,
            StageOptions::LambdaPromote(o) => map.serialize_entry("with", o)?,
            StageOptions::EcsSync(o) => map.serialize_entry("with", o)?,
        }
        map.end()
    }
}
