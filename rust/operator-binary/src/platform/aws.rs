//! AWS platform adapter (spec §4.3): the fully fleshed-out adapter, since AWS is the
//! platform spec.md names concretely.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use serde_json::{json, Value};

use crate::config::generator::ReleaseImage;
use crate::crd::hosted_cluster::HostedCluster;
use crate::crd::platform::AwsNodePoolPlatform;
use crate::crd::{NodePool, ANNOTATION_AWS_REQUIRE_IMDSV2};

use super::{Error, NotReadySnafu, PlatformAdapter};
use snafu::OptionExt;

/// Tag stamped on every NodePool-owned AWS resource enforcing cluster ownership (spec
/// §4.3 "tags... enforcing the cluster-ownership tag").
const TAG_CLUSTER_OWNERSHIP_PREFIX: &str = "kubernetes.io/cluster/";

pub struct Aws<'a> {
    pub spec: &'a AwsNodePoolPlatform,
}

impl PlatformAdapter for Aws<'_> {
    fn build_machine_template_spec(
        &self,
        node_pool: &NodePool,
        hosted_cluster: &HostedCluster,
        release: &dyn ReleaseImage,
    ) -> Result<Value, Error> {
        let ami = match &self.spec.ami {
            Some(ami) => ami.clone(),
            None => {
                let arch = node_pool
                    .spec
                    .arch
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "amd64".to_string());
                let region = hosted_cluster
                    .spec
                    .platform
                    .as_ref()
                    .and_then(|p| p.aws.as_ref())
                    .and_then(|aws| aws.region.as_deref())
                    .unwrap_or("us-east-1");
                release.ami(region, &arch).context(NotReadySnafu {
                    message: format!("no AMI published for release in {region}/{arch}"),
                })?
            }
        };

        let default_sg = hosted_cluster
            .status
            .as_ref()
            .and_then(|s| s.aws_default_worker_sg.as_deref());

        let mut security_group_ids = self.spec.security_group_ids.clone();
        if let Some(default_sg) = default_sg {
            if !security_group_ids.iter().any(|id| id == default_sg) {
                security_group_ids.push(default_sg.to_string());
            }
        } else if security_group_ids.is_empty() {
            return Err(Error::NotReady {
                message: "default worker security group not yet created".to_string(),
            });
        }

        let tags = merged_tags(self.spec, node_pool);

        let http_tokens = if node_pool.metadata_annotation_true(ANNOTATION_AWS_REQUIRE_IMDSV2) {
            "required"
        } else {
            "optional"
        };

        let public_ip = hosted_cluster
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get("hypershift.openshift.io/aws-public-ip"))
            .map(|v| v == "true")
            .unwrap_or(false);

        Ok(json!({
            "ami": { "id": ami },
            "instanceType": self.spec.instance_type,
            "subnet": { "id": self.spec.subnet_id },
            "securityGroups": security_group_ids
                .into_iter()
                .map(|id| json!({ "id": id }))
                .collect::<Vec<_>>(),
            "iamInstanceProfile": self.spec.instance_profile,
            "rootVolume": {
                "size": self.spec.root_volume.size_gib,
                "type": self.spec.root_volume.volume_type,
            },
            "tenancy": self.spec.tenancy.to_string().to_lowercase(),
            "publicIP": public_ip,
            "additionalTags": tags,
            "metadataOptions": {
                "httpTokens": http_tokens,
                "httpPutResponseHopLimit": 2,
                "httpEndpoint": "enabled",
                "instanceMetadataTags": "disabled",
            },
        }))
    }

    fn set_platform_conditions(
        &self,
        _node_pool: &NodePool,
        hosted_cluster: &HostedCluster,
    ) -> Vec<Condition> {
        let valid = hosted_cluster
            .status
            .as_ref()
            .is_some_and(|s| s.aws_default_worker_sg.is_some())
            || !self.spec.security_group_ids.is_empty();
        vec![Condition {
            type_: "ValidPlatformImage".to_string(),
            status: if valid { "True" } else { "False" }.to_string(),
            reason: if valid {
                "AsExpected"
            } else {
                "ValidationFailed"
            }
            .to_string(),
            message: if valid {
                "AWS platform configuration is valid".to_string()
            } else {
                "no security groups available for this NodePool".to_string()
            },
            observed_generation: None,
            last_transition_time: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ),
        }]
    }
}

fn merged_tags(spec: &AwsNodePoolPlatform, node_pool: &NodePool) -> BTreeMap<String, String> {
    let mut tags = spec.resource_tags.clone();
    tags.insert(
        format!("{TAG_CLUSTER_OWNERSHIP_PREFIX}{}", node_pool.spec.cluster_name),
        "owned".to_string(),
    );
    tags
}

trait AnnotationTruthy {
    fn metadata_annotation_true(&self, key: &str) -> bool;
}

impl AnnotationTruthy for NodePool {
    fn metadata_annotation_true(&self, key: &str) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::hosted_cluster::{HostedClusterSpec, HostedClusterStatus, LocalObjectReference};
    use crate::crd::platform::{AwsRootVolume, AwsTenancy, NodePoolPlatform};
    use crate::crd::{NodePoolManagement, NodePoolReleaseImage, NodePoolSpec};
    use kube::ResourceExt;

    struct FixedRelease;
    impl ReleaseImage for FixedRelease {
        fn reference(&self) -> &str {
            "quay.io/release:r1"
        }
        fn version(&self) -> &str {
            "4.18.0"
        }
        fn ami(&self, _region: &str, _arch: &str) -> Option<String> {
            Some("ami-release-default".to_string())
        }
    }

    fn sample_aws_spec() -> AwsNodePoolPlatform {
        AwsNodePoolPlatform {
            instance_type: "m5.xlarge".to_string(),
            ami: None,
            subnet_id: "subnet-abc".to_string(),
            security_group_ids: vec![],
            instance_profile: None,
            root_volume: AwsRootVolume::default(),
            tenancy: AwsTenancy::default(),
            resource_tags: BTreeMap::new(),
        }
    }

    fn sample_node_pool(aws: AwsNodePoolPlatform) -> NodePool {
        NodePool::new(
            "workers",
            NodePoolSpec {
                cluster_name: "my-cluster".to_string(),
                platform: NodePoolPlatform::Aws(aws),
                replicas: Some(3),
                auto_scaling: None,
                release: NodePoolReleaseImage {
                    image: "quay.io/release:r1".to_string(),
                },
                config: vec![],
                tuning_config: vec![],
                management: NodePoolManagement::default(),
                node_labels: BTreeMap::new(),
                taints: vec![],
                arch: None,
                paused_until: None,
                auto_repair: false,
            },
        )
    }

    fn sample_hosted_cluster(default_sg: Option<&str>) -> HostedCluster {
        let mut hc = HostedCluster::new(
            "my-cluster",
            HostedClusterSpec {
                pull_secret: LocalObjectReference {
                    name: "pull".to_string(),
                },
                additional_trust_bundle: None,
                configuration: None,
                platform: None,
            },
        );
        hc.status = Some(HostedClusterStatus {
            aws_default_worker_sg: default_sg.map(str::to_string),
            ..HostedClusterStatus::default()
        });
        hc
    }

    #[test]
    fn not_ready_when_no_security_groups_available() {
        let aws_spec = sample_aws_spec();
        let node_pool = sample_node_pool(aws_spec.clone());
        let hosted_cluster = sample_hosted_cluster(None);
        let adapter = Aws { spec: &aws_spec };
        let err = adapter
            .build_machine_template_spec(&node_pool, &hosted_cluster, &FixedRelease)
            .unwrap_err();
        assert!(err.is_not_ready());
    }

    #[test]
    fn default_security_group_is_injected() {
        let aws_spec = sample_aws_spec();
        let node_pool = sample_node_pool(aws_spec.clone());
        let hosted_cluster = sample_hosted_cluster(Some("sg-default"));
        let adapter = Aws { spec: &aws_spec };
        let spec = adapter
            .build_machine_template_spec(&node_pool, &hosted_cluster, &FixedRelease)
            .unwrap();
        let sgs = spec["securityGroups"].as_array().unwrap();
        assert_eq!(sgs.len(), 1);
        assert_eq!(sgs[0]["id"], "sg-default");
    }

    #[test]
    fn cluster_ownership_tag_is_always_present() {
        let aws_spec = sample_aws_spec();
        let node_pool = sample_node_pool(aws_spec.clone());
        let hosted_cluster = sample_hosted_cluster(Some("sg-default"));
        let adapter = Aws { spec: &aws_spec };
        let spec = adapter
            .build_machine_template_spec(&node_pool, &hosted_cluster, &FixedRelease)
            .unwrap();
        let tags = spec["additionalTags"].as_object().unwrap();
        assert_eq!(
            tags.get("kubernetes.io/cluster/my-cluster").unwrap(),
            "owned"
        );
    }

    #[test]
    fn imdsv2_defaults_to_optional() {
        let aws_spec = sample_aws_spec();
        let node_pool = sample_node_pool(aws_spec.clone());
        assert_eq!(node_pool.name_any(), "workers");
        let hosted_cluster = sample_hosted_cluster(Some("sg-default"));
        let adapter = Aws { spec: &aws_spec };
        let spec = adapter
            .build_machine_template_spec(&node_pool, &hosted_cluster, &FixedRelease)
            .unwrap();
        assert_eq!(spec["metadataOptions"]["httpTokens"], "optional");
    }
}
