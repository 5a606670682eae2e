//! MachineSet reconcile for `UpgradeType::InPlace` (spec §4.4): same skeleton as
//! [`crate::rollout::replace`], plus `MaxUnavailable` annotation, template-based
//! label/taint propagation (no change-detection dance needed here, since an in-place
//! MachineSet's template never triggers a downstream rolling replace), and
//! target/current config-version seeding.

pub mod guest;
pub mod upgrader;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Node, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use snafu::{ResultExt, Snafu};

use crate::conditions::REASON_AS_EXPECTED;
use crate::crd::capi::{
    Machine, MachineBootstrap, MachineSetSpec, MachineSpec, MachineTemplateMetadata,
    MachineTemplateSpec, ANNOTATION_CURRENT_CONFIG_VERSION, ANNOTATION_MAX_UNAVAILABLE,
    ANNOTATION_TARGET_CONFIG_VERSION,
};
use crate::crd::{NodePool, ANNOTATION_MANAGED_TAINTS, ANNOTATION_NODE_POOL, MANAGED_LABEL_PREFIX};

use super::replicas;

const FIELD_MANAGER: &str = "hypershift-nodepool-operator";

#[allow(clippy::too_many_arguments)]
pub fn build_desired(
    node_pool: &NodePool,
    machine_template_ref: &ObjectReference,
    user_data_secret_name: &str,
    hash: &str,
    current_replicas: Option<i32>,
) -> MachineSetSpec {
    let replica_resolution = replicas::resolve(node_pool, current_replicas);

    let mut labels = BTreeMap::new();
    labels.insert("cluster.x-k8s.io/cluster-name".to_string(), node_pool.spec.cluster_name.clone());
    for (key, value) in &node_pool.spec.node_labels {
        labels.insert(format!("{MANAGED_LABEL_PREFIX}{key}"), value.clone());
    }

    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_NODE_POOL.to_string(), node_pool.back_reference());
    if let Ok(taints) = serde_json::to_string(&node_pool.spec.taints) {
        annotations.insert(ANNOTATION_MANAGED_TAINTS.to_string(), taints);
    }

    MachineSetSpec {
        cluster_name: node_pool.spec.cluster_name.clone(),
        replicas: Some(replica_resolution.replicas()),
        selector: LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "cluster.x-k8s.io/cluster-name".to_string(),
                node_pool.spec.cluster_name.clone(),
            )])),
            ..LabelSelector::default()
        },
        template: MachineTemplateSpec {
            metadata: MachineTemplateMetadata { labels, annotations },
            spec: MachineSpec {
                cluster_name: node_pool.spec.cluster_name.clone(),
                version: Some(hash.to_string()),
                bootstrap: MachineBootstrap {
                    data_secret_name: Some(user_data_secret_name.to_string()),
                },
                infrastructure_ref: machine_template_ref.clone(),
            },
        },
    }
}

pub fn resolve_max_unavailable(node_pool: &NodePool, total: i32) -> i32 {
    node_pool
        .spec
        .management
        .in_place
        .as_ref()
        .and_then(|p| p.max_unavailable.as_ref())
        .map(|v| v.resolve(total))
        .unwrap_or(1)
}

pub fn max_unavailable_annotation(node_pool: &NodePool, total: i32) -> (&'static str, String) {
    (ANNOTATION_MAX_UNAVAILABLE, resolve_max_unavailable(node_pool, total).to_string())
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("guest cluster client: {source}"))]
    GuestClient { source: guest::Error },
    #[snafu(display("failed to get guest Node {name}: {source}"))]
    GetNode { name: String, source: kube::Error },
    #[snafu(display("failed to patch guest Node {name}: {source}"))]
    PatchNode { name: String, source: kube::Error },
    #[snafu(display("failed to apply reconfigure payload ConfigMap: {source}"))]
    ApplyPayloadConfigMap { source: kube::Error },
    #[snafu(display("failed to apply reconfigure Pod: {source}"))]
    ApplyReconfigurePod { source: kube::Error },
    #[snafu(display("failed to delete completed reconfigure Pod {name}: {source}"))]
    DeleteReconfigurePod { name: String, source: kube::Error },
}

/// Outcome of one in-place-upgrade execution pass; the caller folds this into the
/// MachineSet's `UpgradeInProgress`/`CurrentConfigVersion` annotations.
pub struct ExecutionOutcome {
    pub upgrade_in_progress: Option<String>,
    pub completed_config_version: Option<String>,
}

/// Runs one batch of the in-place upgrader (spec §4.5) against the guest cluster: lists the
/// NodePool's Nodes, plans a batch, and for any selected Node applies the reconfigure payload
/// ConfigMap and Pod and writes its `DesiredMachineConfig` annotation.
#[allow(clippy::too_many_arguments)]
pub async fn execute(
    management_client: &Client,
    control_plane_namespace: &str,
    hosted_cluster_name: &str,
    node_pool: &NodePool,
    machines: &[Machine],
    target_config_version: &str,
    current_config_version: Option<&str>,
    max_unavailable: i32,
    payload: &str,
) -> Result<ExecutionOutcome, Error> {
    if current_config_version == Some(target_config_version) {
        return Ok(ExecutionOutcome {
            upgrade_in_progress: None,
            completed_config_version: None,
        });
    }

    let guest_client = guest::client_for(management_client, control_plane_namespace, hosted_cluster_name)
        .await
        .context(GuestClientSnafu)?;
    let nodes_api: Api<Node> = Api::all(guest_client.clone());

    let node_names: Vec<String> = machines
        .iter()
        .filter_map(|machine| {
            machine
                .status
                .as_ref()
                .and_then(|status| status.node_ref.as_ref())
                .and_then(|node_ref| node_ref.name.clone())
        })
        .collect();

    if node_names.is_empty() {
        // No Machine has booted into a Node yet; nothing to reconfigure this pass.
        return Ok(ExecutionOutcome {
            upgrade_in_progress: Some("true".to_string()),
            completed_config_version: None,
        });
    }

    let mut node_states = Vec::with_capacity(node_names.len());
    for name in &node_names {
        let node = nodes_api
            .get_opt(name)
            .await
            .context(GetNodeSnafu { name: name.clone() })?;
        let annotations = node
            .as_ref()
            .and_then(|n| n.metadata.annotations.clone())
            .unwrap_or_default();
        node_states.push(upgrader::NodeState {
            name: name.clone(),
            desired_machine_config: annotations.get(upgrader::ANNOTATION_DESIRED_MACHINE_CONFIG).cloned(),
            current_machine_config: annotations.get(upgrader::ANNOTATION_CURRENT_MACHINE_CONFIG).cloned(),
            daemon_state: annotations.get(upgrader::ANNOTATION_DAEMON_STATE).cloned(),
        });
    }

    cleanup_completed_reconfigure_pods(&guest_client, node_pool, &node_states, target_config_version).await?;

    let plan = upgrader::plan_batch(&node_states, target_config_version, max_unavailable);

    if let Some(degraded) = plan.degraded {
        return Ok(ExecutionOutcome {
            upgrade_in_progress: Some(degraded.reason),
            completed_config_version: None,
        });
    }
    if plan.complete {
        return Ok(ExecutionOutcome {
            upgrade_in_progress: None,
            completed_config_version: Some(target_config_version.to_string()),
        });
    }

    let config_map = upgrader::build_payload_config_map(node_pool, target_config_version, payload);
    let config_map_namespace = config_map.metadata.namespace.clone().unwrap_or_default();
    let config_map_name = config_map.metadata.name.clone().unwrap_or_default();
    let config_map_api: Api<ConfigMap> = Api::namespaced(guest_client.clone(), &config_map_namespace);
    config_map_api
        .patch(&config_map_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&config_map))
        .await
        .context(ApplyPayloadConfigMapSnafu)?;

    for node_name in &plan.selected {
        let annotation_patch = serde_json::json!({
            "metadata": { "annotations": { upgrader::ANNOTATION_DESIRED_MACHINE_CONFIG: target_config_version } }
        });
        nodes_api
            .patch(node_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&annotation_patch))
            .await
            .context(PatchNodeSnafu { name: node_name.clone() })?;

        let pod = upgrader::build_reconfigure_pod(node_pool, node_name, target_config_version);
        let pod_namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let pod_api: Api<Pod> = Api::namespaced(guest_client.clone(), &pod_namespace);
        pod_api
            .patch(&pod_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&pod))
            .await
            .context(ApplyReconfigurePodSnafu)?;
    }

    Ok(ExecutionOutcome {
        upgrade_in_progress: Some("true".to_string()),
        completed_config_version: None,
    })
}

/// Deletes the reconfigure Pod for any Node that has already finished reconfiguring to
/// `target` (spec.md Open Question: the reconfigure workload's cleanup policy covers Pods
/// only, not the payload ConfigMap or its Namespace).
async fn cleanup_completed_reconfigure_pods(
    guest_client: &Client,
    node_pool: &NodePool,
    node_states: &[upgrader::NodeState],
    target_config_version: &str,
) -> Result<(), Error> {
    let namespace = node_pool.metadata.namespace.clone().unwrap_or_default();
    let pod_api: Api<Pod> = Api::namespaced(guest_client.clone(), &namespace);

    for node_state in node_states {
        let done = node_state.current_machine_config.as_deref() == Some(target_config_version)
            && node_state.daemon_state.as_deref() == Some(upgrader::DAEMON_STATE_DONE);
        if !done {
            continue;
        }
        let pod_name = upgrader::reconfigure_pod_name(node_pool, &node_state.name, target_config_version);
        match pod_api.delete(&pod_name, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(source) => return Err(Error::DeleteReconfigurePod { name: pod_name, source }),
        }
    }
    Ok(())
}

/// Config-version bookkeeping for a MachineSet (spec §4.4 "MachineSet reconcile"):
/// - a brand-new MachineSet (no `CurrentConfigVersion` recorded yet) seeds current equal
///   to target, so no in-place upgrade runs on the MachineSet's very first reconcile;
/// - otherwise the target is (re)written whenever `user_data_secret_name` changes.
pub struct ConfigVersionUpdate {
    pub target_config_version: String,
    pub current_config_version: Option<String>,
}

pub fn resolve_config_version(
    hash: &str,
    observed_annotations: &BTreeMap<String, String>,
) -> ConfigVersionUpdate {
    let current = observed_annotations.get(ANNOTATION_CURRENT_CONFIG_VERSION).cloned();
    match current {
        None => ConfigVersionUpdate {
            target_config_version: hash.to_string(),
            current_config_version: Some(hash.to_string()),
        },
        Some(current) => ConfigVersionUpdate {
            target_config_version: hash.to_string(),
            current_config_version: Some(current),
        },
    }
}

pub fn is_in_place_complete(observed_annotations: &BTreeMap<String, String>) -> bool {
    match (
        observed_annotations.get(ANNOTATION_CURRENT_CONFIG_VERSION),
        observed_annotations.get(ANNOTATION_TARGET_CONFIG_VERSION),
    ) {
        (Some(current), Some(target)) => current == target,
        _ => true,
    }
}

/// Translates the in-place upgrader's `UpgradeInProgress` annotation (spec §4.4) into
/// `UpdatingVersion`/`UpdatingConfig` condition inputs.
pub fn upgrade_in_progress_condition(upgrade_in_progress: Option<&str>) -> (bool, &'static str, String) {
    match upgrade_in_progress {
        Some("true") => (true, REASON_AS_EXPECTED, "in-place upgrade in progress".to_string()),
        Some(reason) => (
            false,
            "InplaceUpgradeFailed",
            format!("in-place upgrade halted: {reason}"),
        ),
        None => (false, REASON_AS_EXPECTED, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_max_unavailable_defaults_to_one() {
        let np = crate::crd::NodePool::new(
            "workers",
            crate::crd::NodePoolSpec {
                cluster_name: "hc".into(),
                platform: crate::crd::platform::NodePoolPlatform::None,
                replicas: Some(5),
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
        assert_eq!(resolve_max_unavailable(&np, 5), 1);
    }

    #[test]
    fn brand_new_machine_set_seeds_current_equal_to_target() {
        let update = resolve_config_version("hash1", &BTreeMap::new());
        assert_eq!(update.current_config_version.as_deref(), Some("hash1"));
        assert_eq!(update.target_config_version, "hash1");
    }

    #[test]
    fn existing_current_version_is_preserved_until_upgrader_advances_it() {
        let mut observed = BTreeMap::new();
        observed.insert(ANNOTATION_CURRENT_CONFIG_VERSION.to_string(), "hash0".to_string());
        let update = resolve_config_version("hash1", &observed);
        assert_eq!(update.current_config_version.as_deref(), Some("hash0"));
        assert_eq!(update.target_config_version, "hash1");
    }

    #[test]
    fn completion_requires_matching_versions() {
        let mut observed = BTreeMap::new();
        observed.insert(ANNOTATION_CURRENT_CONFIG_VERSION.to_string(), "hash1".to_string());
        observed.insert(ANNOTATION_TARGET_CONFIG_VERSION.to_string(), "hash1".to_string());
        assert!(is_in_place_complete(&observed));

        observed.insert(ANNOTATION_TARGET_CONFIG_VERSION.to_string(), "hash2".to_string());
        assert!(!is_in_place_complete(&observed));
    }

    #[test]
    fn upgrade_in_progress_true_maps_to_updating() {
        let (updating, reason, _) = upgrade_in_progress_condition(Some("true"));
        assert!(updating);
        assert_eq!(reason, REASON_AS_EXPECTED);

        let (updating, reason, _) = upgrade_in_progress_condition(Some("NodeDegraded"));
        assert!(!updating);
        assert_eq!(reason, "InplaceUpgradeFailed");
    }
}
