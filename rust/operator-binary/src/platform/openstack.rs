//! OpenStack platform adapter (spec §4.3).

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use serde_json::{json, Value};

use crate::config::generator::ReleaseImage;
use crate::crd::hosted_cluster::HostedCluster;
use crate::crd::platform::OpenStackNodePoolPlatform;
use crate::crd::NodePool;

use super::{Error, PlatformAdapter};

pub struct OpenStack<'a> {
    pub spec: &'a OpenStackNodePoolPlatform,
}

impl PlatformAdapter for OpenStack<'_> {
    fn build_machine_template_spec(
        &self,
        _node_pool: &NodePool,
        _hosted_cluster: &HostedCluster,
        _release: &dyn ReleaseImage,
    ) -> Result<Value, Error> {
        Ok(json!({
            "flavor": self.spec.flavor,
            "image": self.spec.image_name.as_deref().map(|name| json!({ "name": name })),
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
