//! In-place Upgrader (spec §4.5): per-Node reconfigure sequencing. Desired-state
//! builders only — no `kube::Client` calls here, matching the rest of the rollout
//! engine's pure-function-plus-thin-apply-loop split.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, HostPathVolumeSource, Pod, PodSpec, Toleration,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::NodePool;

pub const ANNOTATION_DESIRED_MACHINE_CONFIG: &str = "machineconfiguration.openshift.io/desiredConfig";
pub const ANNOTATION_CURRENT_MACHINE_CONFIG: &str = "machineconfiguration.openshift.io/currentConfig";
pub const ANNOTATION_DAEMON_STATE: &str = "machineconfiguration.openshift.io/state";

pub const DAEMON_STATE_DONE: &str = "Done";
pub const DAEMON_STATE_DEGRADED: &str = "Degraded";

pub const PAYLOAD_CONFIG_MAP_KEY: &str = "config";

/// A Node's observed reconfigure-relevant annotations, as read off the live object by
/// the caller.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub name: String,
    pub desired_machine_config: Option<String>,
    pub current_machine_config: Option<String>,
    pub daemon_state: Option<String>,
}

impl NodeState {
    fn is_at_target(&self, target: &str) -> bool {
        self.desired_machine_config.as_deref() == Some(target)
    }

    fn is_done(&self, target: &str) -> bool {
        self.current_machine_config.as_deref() == Some(target)
            && self.daemon_state.as_deref() == Some(DAEMON_STATE_DONE)
    }

    fn is_degraded(&self) -> bool {
        self.daemon_state.as_deref() == Some(DAEMON_STATE_DEGRADED)
    }
}

/// Outcome of one batch-selection pass (spec §4.5).
pub struct BatchPlan {
    /// Nodes selected this round, bounded by `max_unavailable` minus the nodes already
    /// mid-reconfigure.
    pub selected: Vec<String>,
    pub complete: bool,
    pub degraded: Option<DegradedNode>,
}

pub struct DegradedNode {
    pub name: String,
    pub reason: String,
}

/// Selects up to `max_unavailable` Nodes whose `desiredMachineConfig` annotation does
/// not yet match `target`, halting immediately if any in-flight Node reports
/// `Degraded` (spec §4.5 "Failure semantics": halt the batch, don't remove Nodes).
pub fn plan_batch(nodes: &[NodeState], target: &str, max_unavailable: i32) -> BatchPlan {
    if let Some(degraded) = nodes.iter().find(|n| n.is_degraded()) {
        return BatchPlan {
            selected: Vec::new(),
            complete: false,
            degraded: Some(DegradedNode {
                name: degraded.name.clone(),
                reason: degraded
                    .daemon_state
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            }),
        };
    }

    let in_flight = nodes.iter().filter(|n| n.is_at_target(target) && !n.is_done(target)).count();
    let not_done = nodes.iter().filter(|n| !n.is_done(target)).count();

    if not_done == 0 {
        return BatchPlan {
            selected: Vec::new(),
            complete: true,
            degraded: None,
        };
    }

    let remaining_capacity = (max_unavailable as usize).saturating_sub(in_flight);
    let selected = nodes
        .iter()
        .filter(|n| !n.is_at_target(target) && !n.is_done(target))
        .take(remaining_capacity)
        .map(|n| n.name.clone())
        .collect();

    BatchPlan {
        selected,
        complete: false,
        degraded: None,
    }
}

/// Name of the per-Node reconfigure Pod: a batch can reconfigure several Nodes at once,
/// each bound to its own Node by a hostname node-selector, so each needs a distinct name.
pub fn reconfigure_pod_name(node_pool: &NodePool, node_name: &str, hash: &str) -> String {
    let sanitized_node_name: String = node_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!(
        "nodepool-reconfigure-{}-{sanitized_node_name}-{hash}",
        kube::ResourceExt::name_any(node_pool)
    )
}

/// The privileged per-Node reconfigure Pod (spec §4.5): host-network, host-PID,
/// tolerate-all, bound to one Node by a hostname node-selector, mounting the payload
/// ConfigMap alongside the host filesystem.
pub fn build_reconfigure_pod(node_pool: &NodePool, node_name: &str, hash: &str) -> Pod {
    let name = reconfigure_pod_name(node_pool, node_name, hash);
    let config_map_name = format!("nodepool-reconfigure-{}-{hash}", kube::ResourceExt::name_any(node_pool));

    let mut node_selector = BTreeMap::new();
    node_selector.insert("kubernetes.io/hostname".to_string(), node_name.to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: node_pool.metadata.namespace.clone(),
            labels: Some(BTreeMap::from([(
                "hypershift.openshift.io/nodepool-reconfigure".to_string(),
                "true".to_string(),
            )])),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            host_network: Some(true),
            host_pid: Some(true),
            node_selector: Some(node_selector),
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Toleration::default()
            }]),
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "reconfigure".to_string(),
                image: Some("quay.io/hypershift/nodepool-reconfigure-agent:latest".to_string()),
                security_context: Some(k8s_openapi::api::core::v1::SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: "payload".to_string(),
                        mount_path: "/etc/nodepool-reconfigure".to_string(),
                        ..VolumeMount::default()
                    },
                    VolumeMount {
                        name: "host-root".to_string(),
                        mount_path: "/host".to_string(),
                        ..VolumeMount::default()
                    },
                ]),
                ..Container::default()
            }],
            volumes: Some(vec![
                Volume {
                    name: "payload".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: Some(config_map_name),
                        ..ConfigMapVolumeSource::default()
                    }),
                    ..Volume::default()
                },
                Volume {
                    name: "host-root".to_string(),
                    host_path: Some(HostPathVolumeSource {
                        path: "/".to_string(),
                        ..HostPathVolumeSource::default()
                    }),
                    ..Volume::default()
                },
            ]),
            ..PodSpec::default()
        }),
        status: None,
    }
}

pub fn build_payload_config_map(node_pool: &NodePool, hash: &str, payload: &str) -> ConfigMap {
    let name = format!("nodepool-reconfigure-{}-{hash}", kube::ResourceExt::name_any(node_pool));
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: node_pool.metadata.namespace.clone(),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(
            PAYLOAD_CONFIG_MAP_KEY.to_string(),
            payload.to_string(),
        )])),
        ..ConfigMap::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, desired: Option<&str>, current: Option<&str>, state: Option<&str>) -> NodeState {
        NodeState {
            name: name.to_string(),
            desired_machine_config: desired.map(str::to_string),
            current_machine_config: current.map(str::to_string),
            daemon_state: state.map(str::to_string),
        }
    }

    #[test]
    fn selects_up_to_max_unavailable() {
        let nodes = vec![
            node("n1", Some("old"), Some("old"), Some("Done")),
            node("n2", Some("old"), Some("old"), Some("Done")),
            node("n3", Some("old"), Some("old"), Some("Done")),
        ];
        let plan = plan_batch(&nodes, "new", 2);
        assert_eq!(plan.selected.len(), 2);
        assert!(!plan.complete);
        assert!(plan.degraded.is_none());
    }

    #[test]
    fn in_flight_nodes_reduce_remaining_capacity() {
        let nodes = vec![
            node("n1", Some("new"), Some("old"), Some("Working")),
            node("n2", Some("old"), Some("old"), Some("Done")),
            node("n3", Some("old"), Some("old"), Some("Done")),
        ];
        let plan = plan_batch(&nodes, "new", 2);
        assert_eq!(plan.selected, vec!["n2".to_string()]);
    }

    #[test]
    fn complete_when_all_nodes_done() {
        let nodes = vec![
            node("n1", Some("new"), Some("new"), Some("Done")),
            node("n2", Some("new"), Some("new"), Some("Done")),
        ];
        let plan = plan_batch(&nodes, "new", 2);
        assert!(plan.complete);
        assert!(plan.selected.is_empty());
    }

    #[test]
    fn reconfigure_pod_names_are_distinct_per_node() {
        let np = crate::crd::NodePool::new(
            "workers",
            crate::crd::NodePoolSpec {
                cluster_name: "hc".into(),
                platform: crate::crd::platform::NodePoolPlatform::None,
                replicas: Some(2),
                auto_scaling: None,
                release: crate::crd::NodePoolReleaseImage { image: "r1".into() },
                config: vec![],
                tuning_config: vec![],
                management: crate::crd::NodePoolManagement::default(),
                node_labels: BTreeMap::new(),
                taints: vec![],
                arch: None,
                paused_until: None,
                auto_repair: false,
            },
        );

        let name_a = reconfigure_pod_name(&np, "node-a.example.com", "hash1");
        let name_b = reconfigure_pod_name(&np, "node-b.example.com", "hash1");
        assert_ne!(name_a, name_b);
    }

    #[test]
    fn degraded_node_halts_the_batch() {
        let nodes = vec![
            node("n1", Some("new"), Some("old"), Some("Degraded")),
            node("n2", Some("old"), Some("old"), Some("Done")),
        ];
        let plan = plan_batch(&nodes, "new", 2);
        assert!(plan.selected.is_empty());
        assert!(!plan.complete);
        assert_eq!(plan.degraded.unwrap().name, "n1");
    }
}
