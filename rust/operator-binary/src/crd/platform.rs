//! The sealed `Platform` variant (spec §9 design note) and the per-platform fields a
//! `NodePool` carries in `spec.platform`. Field sets intentionally mirror only what
//! [`crate::platform`] needs to build a machine template (spec §1 Non-goals exclude
//! per-cloud field mapping beyond the rollout contract).

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "PascalCase")]
#[strum(serialize_all = "PascalCase")]
pub enum Platform {
    Aws,
    Azure,
    KubeVirt,
    PowerVs,
    OpenStack,
    Agent,
    None,
}

impl Platform {
    /// Whether the janitor and token manager must retain the user-data Secret across an
    /// upgrade instead of deleting it immediately (spec §4.2/§9).
    pub fn retains_user_data_on_upgrade(&self) -> bool {
        matches!(self, Platform::Aws)
    }

    /// Default `NodeReady` unhealthy timeout for the MachineHealthCheck (spec §4.4).
    pub fn default_unhealthy_timeout(&self) -> std::time::Duration {
        match self {
            Platform::Agent | Platform::None => std::time::Duration::from_secs(16 * 60),
            _ => std::time::Duration::from_secs(8 * 60),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "PascalCase")]
pub enum NodePoolPlatform {
    Aws(AwsNodePoolPlatform),
    Azure(AzureNodePoolPlatform),
    KubeVirt(KubeVirtNodePoolPlatform),
    PowerVs(PowerVsNodePoolPlatform),
    OpenStack(OpenStackNodePoolPlatform),
    Agent(AgentNodePoolPlatform),
    None,
}

impl NodePoolPlatform {
    pub fn kind(&self) -> Platform {
        match self {
            NodePoolPlatform::Aws(_) => Platform::Aws,
            NodePoolPlatform::Azure(_) => Platform::Azure,
            NodePoolPlatform::KubeVirt(_) => Platform::KubeVirt,
            NodePoolPlatform::PowerVs(_) => Platform::PowerVs,
            NodePoolPlatform::OpenStack(_) => Platform::OpenStack,
            NodePoolPlatform::Agent(_) => Platform::Agent,
            NodePoolPlatform::None => Platform::None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsNodePoolPlatform {
    pub instance_type: String,

    /// Explicit AMI override. When unset, the adapter resolves the AMI from the release
    /// image for the NodePool's region and architecture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami: Option<String>,

    pub subnet_id: String,

    #[serde(default)]
    pub security_group_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_profile: Option<String>,

    #[serde(default)]
    pub root_volume: AwsRootVolume,

    #[serde(default)]
    pub tenancy: AwsTenancy,

    #[serde(default)]
    pub resource_tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AwsRootVolume {
    #[serde(default = "AwsRootVolume::default_size_gib")]
    pub size_gib: i64,
    #[serde(default = "AwsRootVolume::default_type")]
    pub volume_type: String,
}

impl AwsRootVolume {
    fn default_size_gib() -> i64 {
        120
    }
    fn default_type() -> String {
        "gp3".to_string()
    }
}

impl Default for AwsRootVolume {
    fn default() -> Self {
        AwsRootVolume {
            size_gib: Self::default_size_gib(),
            volume_type: Self::default_type(),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Display,
)]
#[serde(rename_all = "PascalCase")]
#[strum(serialize_all = "PascalCase")]
pub enum AwsTenancy {
    #[default]
    Default,
    Dedicated,
    Host,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureNodePoolPlatform {
    pub vm_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    pub subnet_name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtNodePoolPlatform {
    pub memory: String,
    pub cores: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_volume_size_gib: Option<i64>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PowerVsNodePoolPlatform {
    pub system_type: String,
    pub processors: String,
    pub memory_gib: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenStackNodePoolPlatform {
    pub flavor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentNodePoolPlatform {
    pub agent_label_selector: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_and_none_get_extended_unhealthy_timeout() {
        assert_eq!(
            Platform::Agent.default_unhealthy_timeout(),
            std::time::Duration::from_secs(16 * 60)
        );
        assert_eq!(
            Platform::None.default_unhealthy_timeout(),
            std::time::Duration::from_secs(16 * 60)
        );
        assert_eq!(
            Platform::Aws.default_unhealthy_timeout(),
            std::time::Duration::from_secs(8 * 60)
        );
    }

    #[test]
    fn only_aws_retains_user_data_on_upgrade() {
        assert!(Platform::Aws.retains_user_data_on_upgrade());
        assert!(!Platform::Azure.retains_user_data_on_upgrade());
        assert!(!Platform::None.retains_user_data_on_upgrade());
    }
}
