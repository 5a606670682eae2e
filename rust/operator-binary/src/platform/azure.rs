//! Azure platform adapter (spec §4.3): field set limited to what the module actually
//! reads from `NodePool.spec.platform.azure` — no AMI-equivalent resolution, Azure
//! `imageId` is always explicit.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use serde_json::{json, Value};

use crate::config::generator::ReleaseImage;
use crate::crd::hosted_cluster::HostedCluster;
use crate::crd::platform::AzureNodePoolPlatform;
use crate::crd::NodePool;

use super::{Error, PlatformAdapter};

pub struct Azure<'a> {
    pub spec: &'a AzureNodePoolPlatform,
}

impl PlatformAdapter for Azure<'_> {
    fn build_machine_template_spec(
        &self,
        _node_pool: &NodePool,
        _hosted_cluster: &HostedCluster,
        _release: &dyn ReleaseImage,
    ) -> Result<Value, Error> {
        Ok(json!({
            "vmSize": self.spec.vm_size,
            "image": self.spec.image_id.as_deref().map(|id| json!({ "id": id })),
            "subnetName": self.spec.subnet_name,
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
