//! `HostedCluster` (spec §3): read-only external input. The controller never writes to
//! its spec or status; it only projects a handful of fields into the rollout config and
//! platform adapters.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hypershift.openshift.io",
    version = "v1alpha1",
    kind = "HostedCluster",
    plural = "hostedclusters",
    namespaced,
    status = "HostedClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HostedClusterSpec {
    pub pull_secret: LocalObjectReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_trust_bundle: Option<LocalObjectReference>,

    #[serde(default)]
    pub configuration: Option<ClusterConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<HostedClusterPlatform>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    pub name: String,
}

/// Backward-compatible projection surface (spec §4.1 "Cluster-wide config"): only proxy
/// and image sub-structs are serialized into the global config string (Open Question #1
/// in DESIGN.md), but the full struct is kept so other consumers can read the rest.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_content_sources: Option<Vec<ImageContentSource>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_trusted_ca: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageContentSource {
    pub source: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostedClusterPlatform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsPlatformSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AwsPlatformSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Whether the control plane owns (and therefore should be added to every NodePool
    /// Machine's security groups) a default worker security group (spec §4.3).
    #[serde(default)]
    pub endpoint_access: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostedClusterStatus {
    /// Public or private endpoint at which the ignition server for this cluster serves
    /// payloads (spec §6).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignition_endpoint: Option<String>,

    /// First CIDR of the cluster network, used by `ClusterNetworkCIDRConflict` (spec §4.7).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_network_cidr: Option<String>,

    /// Name of the default worker security group, when the control plane created one
    /// (AWS only, spec §4.3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_default_worker_sg: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}
