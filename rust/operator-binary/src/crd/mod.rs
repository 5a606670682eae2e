//! The `NodePool` custom resource and the handful of external CRDs this operator reads
//! or writes against (`HostedCluster`, the CAPI machine primitives, and the per-cloud
//! machine templates). The shapes here are this controller's own read/write contract,
//! not the canonical schema source (see spec Non-goals): only the fields the core
//! components actually touch are modelled.

pub mod capi;
pub mod hosted_cluster;
pub mod platform;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use strum::{Display, EnumString};

pub const APP_NAME: &str = "nodepool";

/// Annotation carrying the back-reference from a controller-owned downstream object
/// (Secret, MachineTemplate, MachineDeployment, MachineSet, MachineHealthCheck) to the
/// owning NodePool, formatted as `<namespace>/<name>`.
pub const ANNOTATION_NODE_POOL: &str = "hypershift.openshift.io/nodePool";

/// Annotation recording the `Hash` (see [`crate::config::generator`]) that was active
/// the last time this NodePool completed a rollout.
pub const ANNOTATION_CURRENT_CONFIG_VERSION: &str = "hypershift.openshift.io/currentConfigVersion";

/// Annotation recording the `HashWithoutVersion` active at the last completed rollout.
pub const ANNOTATION_CURRENT_CONFIG: &str = "hypershift.openshift.io/currentConfig";

/// Annotation recording the name of the platform MachineTemplate active at the last
/// completed rollout.
pub const ANNOTATION_PLATFORM_MACHINE_TEMPLATE: &str =
    "hypershift.openshift.io/platformMachineTemplate";

/// Annotation on downstream MachineDeployment/MachineSet objects that short-circuits the
/// downstream controller while the owning NodePool is paused.
pub const ANNOTATION_PAUSED: &str = "hypershift.openshift.io/paused";

/// Annotation prefix used when propagating `NodePool.spec.nodeLabels` directly onto
/// existing Machines (spec §4.4) so that a label change never triggers a rollout.
pub const MANAGED_LABEL_PREFIX: &str = "label.hypershift.openshift.io/";

/// Annotation carrying the JSON-serialized taint list propagated onto existing Machines.
pub const ANNOTATION_MANAGED_TAINTS: &str = "hypershift.openshift.io/taints";

/// Annotation overriding the default AWS IMDS `HTTPTokens` policy from `optional` to
/// `required` (spec §4.3).
pub const ANNOTATION_AWS_REQUIRE_IMDSV2: &str = "hypershift.openshift.io/aws-imdsv2-required";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("NodePool {name} has no namespace"))]
    NoNamespace { name: String },
    #[snafu(display(
        "NodePool replica count is invalid: min {min} must be <= max {max}, both > 0"
    ))]
    InvalidAutoscaling { min: i32, max: i32 },
}

/// A `NodePool` manages the lifecycle of a homogeneous group of worker machines
/// attached to one [`hosted_cluster::HostedCluster`].
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hypershift.openshift.io",
    version = "v1alpha1",
    kind = "NodePool",
    plural = "nodepools",
    namespaced,
    status = "NodePoolStatus",
    shortname = "np"
)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Name of the [`hosted_cluster::HostedCluster`] that owns this NodePool.
    pub cluster_name: String,

    /// Cloud platform this NodePool's Machines run on, and the per-platform fields
    /// needed to build its machine template.
    pub platform: platform::NodePoolPlatform,

    /// Either a fixed replica count, or autoscaling bounds. Exactly one of `replicas`
    /// or `auto_scaling` should be set; when both are absent the pool is scaled to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_scaling: Option<NodePoolAutoScaling>,

    /// Release image reference, e.g. `quay.io/openshift-release-dev/ocp-release:4.18.1-x86_64`.
    pub release: NodePoolReleaseImage,

    /// References to user-supplied OS-configuration documents (`ConfigMap` names) in
    /// this NodePool's own namespace.
    #[serde(default)]
    pub config: Vec<ConfigMapReference>,

    /// References to tuning/NTO-generated documents.
    #[serde(default)]
    pub tuning_config: Vec<ConfigMapReference>,

    #[serde(default)]
    pub management: NodePoolManagement,

    /// Labels propagated onto this NodePool's Nodes/Machines.
    #[serde(default)]
    pub node_labels: BTreeMap<String, String>,

    /// Taints propagated onto this NodePool's Nodes/Machines.
    #[serde(default)]
    pub taints: Vec<NodePoolTaint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<Arch>,

    /// Either the boolean string `"true"`, or an RFC-3339 timestamp up to which
    /// reconciliation should be paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_until: Option<String>,

    #[serde(default)]
    pub auto_repair: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolAutoScaling {
    pub min: i32,
    pub max: i32,
}

impl NodePoolAutoScaling {
    pub fn is_valid(&self) -> bool {
        self.min > 0 && self.max > 0 && self.max >= self.min
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolReleaseImage {
    pub image: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapReference {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolManagement {
    #[serde(default)]
    pub upgrade_type: UpgradeType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<ReplaceUpgrade>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_place: Option<InPlaceUpgrade>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Display)]
#[serde(rename_all = "PascalCase")]
#[strum(serialize_all = "PascalCase")]
pub enum UpgradeType {
    #[default]
    Replace,
    InPlace,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceUpgrade {
    #[serde(default)]
    pub strategy: ReplaceUpgradeStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateReplaceUpgrade>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Display)]
#[serde(rename_all = "PascalCase")]
#[strum(serialize_all = "PascalCase")]
pub enum ReplaceUpgradeStrategy {
    #[default]
    RollingUpdate,
    OnDelete,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateReplaceUpgrade {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrPercent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrPercent>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InPlaceUpgrade {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrPercent>,
}

/// Either a bare non-negative integer, or a percentage string like `"25%"`.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(untagged)]
pub enum IntOrPercent {
    Int(i32),
    Percent(String),
}

impl IntOrPercent {
    /// Resolves against `total`, per spec §4.6/§4.5: floor 1, rounded up for percentages.
    pub fn resolve(&self, total: i32) -> i32 {
        let resolved = match self {
            IntOrPercent::Int(n) => *n,
            IntOrPercent::Percent(p) => {
                let digits = p.trim_end_matches('%');
                let pct: f64 = digits.parse().unwrap_or(0.0);
                ((total as f64) * pct / 100.0).ceil() as i32
            }
        };
        resolved.max(1)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolTaint {
    pub key: String,
    pub value: String,
    pub effect: String,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Arch {
    Amd64,
    Arm64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl NodePool {
    pub fn namespace_or_err(&self) -> Result<String, Error> {
        self.metadata.namespace.clone().context(NoNamespaceSnafu {
            name: self.name_any(),
        })
    }

    /// Whether autoscaling is enabled, per spec §3/§4.6 (`min ≤ max`, both `> 0`).
    pub fn autoscaling(&self) -> Option<&NodePoolAutoScaling> {
        self.spec.auto_scaling.as_ref().filter(|a| a.is_valid())
    }

    /// `spec.replicas`, defaulting to 0 when unset (spec §4.6).
    pub fn desired_replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(0)
    }

    pub fn back_reference(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Whether `spec.pausedUntil` currently pauses reconciliation, and a human-readable
    /// message for the `ReconciliationActive` condition (spec §4.7/§6).
    pub fn pause_state(&self) -> PauseState {
        match &self.spec.paused_until {
            None => PauseState::Active,
            Some(value) if value == "true" => PauseState::PausedForever,
            Some(value) => match chrono::DateTime::parse_from_rfc3339(value) {
                Ok(until) => {
                    if until.with_timezone(&chrono::Utc) > chrono::Utc::now() {
                        PauseState::PausedUntil(until.with_timezone(&chrono::Utc))
                    } else {
                        PauseState::Active
                    }
                }
                Err(_) => PauseState::InvalidValue(value.clone()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseState {
    Active,
    PausedUntil(chrono::DateTime<chrono::Utc>),
    PausedForever,
    InvalidValue(String),
}

impl PauseState {
    pub fn is_paused(&self) -> bool {
        matches!(self, PauseState::PausedUntil(_) | PauseState::PausedForever)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autoscaling_bounds_validate() {
        assert!(NodePoolAutoScaling { min: 1, max: 3 }.is_valid());
        assert!(!NodePoolAutoScaling { min: 3, max: 1 }.is_valid());
        assert!(!NodePoolAutoScaling { min: 0, max: 3 }.is_valid());
    }

    #[test]
    fn int_or_percent_resolves_with_floor_one() {
        assert_eq!(IntOrPercent::Int(0).resolve(10), 1);
        assert_eq!(IntOrPercent::Percent("25%".to_string()).resolve(4), 1);
        assert_eq!(IntOrPercent::Percent("50%".to_string()).resolve(5), 3);
    }

    #[test]
    fn pause_state_parses_boolean_and_timestamp() {
        let mut np = NodePool::new(
            "test",
            NodePoolSpec {
                cluster_name: "hc".into(),
                platform: platform::NodePoolPlatform::None,
                replicas: Some(1),
                auto_scaling: None,
                release: NodePoolReleaseImage {
                    image: "r1".into(),
                },
                config: vec![],
                tuning_config: vec![],
                management: NodePoolManagement::default(),
                node_labels: BTreeMap::new(),
                taints: vec![],
                arch: None,
                paused_until: Some("true".to_string()),
                auto_repair: false,
            },
        );
        assert_eq!(np.pause_state(), PauseState::PausedForever);

        np.spec.paused_until = Some("not-a-timestamp".to_string());
        assert_eq!(
            np.pause_state(),
            PauseState::InvalidValue("not-a-timestamp".to_string())
        );

        np.spec.paused_until = None;
        assert_eq!(np.pause_state(), PauseState::Active);
    }
}
