//! Agent platform adapter (spec §4.3): Machines correspond to pre-existing bare-metal
//! Agents matched by a label selector rather than provisioned by this controller, and the
//! `None` platform, which provisions nothing at all (spec §1 "bring your own Machines").

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use serde_json::{json, Value};

use crate::config::generator::ReleaseImage;
use crate::crd::hosted_cluster::HostedCluster;
use crate::crd::platform::AgentNodePoolPlatform;
use crate::crd::NodePool;

use super::{Error, PlatformAdapter};

pub struct Agent<'a> {
    pub spec: &'a AgentNodePoolPlatform,
}

impl PlatformAdapter for Agent<'_> {
    fn build_machine_template_spec(
        &self,
        _node_pool: &NodePool,
        _hosted_cluster: &HostedCluster,
        _release: &dyn ReleaseImage,
    ) -> Result<Value, Error> {
        Ok(json!({
            "agentLabelSelector": {
                "matchLabels": self.spec.agent_label_selector,
            },
        }))
    }

    fn set_platform_conditions(
        &self,
        _node_pool: &NodePool,
        _hosted_cluster: &HostedCluster,
    ) -> Vec<Condition> {
        Vec::new()
    }
}

/// `NodePoolPlatform::None` (spec §1): no cloud at all, Machines are created and managed
/// by something outside this controller entirely. The adapter has nothing to contribute.
pub struct NoPlatform;

impl PlatformAdapter for NoPlatform {
    fn build_machine_template_spec(
        &self,
        _node_pool: &NodePool,
        _hosted_cluster: &HostedCluster,
        _release: &dyn ReleaseImage,
    ) -> Result<Value, Error> {
        Ok(Value::Null)
    }

    fn set_platform_conditions(
        &self,
        _node_pool: &NodePool,
        _hosted_cluster: &HostedCluster,
    ) -> Vec<Condition> {
        Vec::new()
    }
}
