//! IBM Power Systems Virtual Server platform adapter (spec §4.3).

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use serde_json::{json, Value};

use crate::config::generator::ReleaseImage;
use crate::crd::hosted_cluster::HostedCluster;
use crate::crd::platform::PowerVsNodePoolPlatform;
use crate::crd::NodePool;

use super::{Error, PlatformAdapter};

pub struct PowerVs<'a> {
    pub spec: &'a PowerVsNodePoolPlatform,
}

impl PlatformAdapter for PowerVs<'_> {
    fn build_machine_template_spec(
        &self,
        _node_pool: &NodePool,
        _hosted_cluster: &HostedCluster,
        _release: &dyn ReleaseImage,
    ) -> Result<Value, Error> {
        Ok(json!({
            "systemType": self.spec.system_type,
            "processors": self.spec.processors,
            "memoryGiB": self.spec.memory_gib,
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
