//! KubeVirt platform adapter (spec §4.3): Machines are VirtualMachineInstances on a
//! management cluster, sized directly from `spec.platform.kubeVirt`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use serde_json::{json, Value};

use crate::config::generator::ReleaseImage;
use crate::crd::hosted_cluster::HostedCluster;
use crate::crd::platform::KubeVirtNodePoolPlatform;
use crate::crd::NodePool;

use super::{Error, PlatformAdapter};

pub struct KubeVirt<'a> {
    pub spec: &'a KubeVirtNodePoolPlatform,
}

impl PlatformAdapter for KubeVirt<'_> {
    fn build_machine_template_spec(
        &self,
        _node_pool: &NodePool,
        _hosted_cluster: &HostedCluster,
        _release: &dyn ReleaseImage,
    ) -> Result<Value, Error> {
        Ok(json!({
            "domain": {
                "memory": self.spec.memory,
                "cores": self.spec.cores,
            },
            "rootVolume": {
                "sizeGib": self.spec.root_volume_size_gib,
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
