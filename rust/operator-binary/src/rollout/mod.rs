//! Rollout Engine / CAPI Orchestrator (spec §4.4, §4.6): the largest component, entry
//! point for the "active path" of a reconcile. Owns machine-template GC and
//! create-or-update, dispatches to [`replace`] or [`inplace`] by upgrade type, and
//! reconciles the MachineHealthCheck.

pub mod inplace;
pub mod replace;
pub mod replicas;

use std::hash::Hasher;

use fnv::FnvHasher;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::{Client, ResourceExt};
use serde_json::Value;
use snafu::{ResultExt, Snafu};

use crate::config::generator::ReleaseImage;
use crate::crd::capi::{
    Machine, MachineDeployment, MachineHealthCheck, MachineHealthCheckSpec, MachineSet,
    UnhealthyCondition,
};
use crate::crd::hosted_cluster::HostedCluster;
use crate::crd::{
    NodePool, UpgradeType, ANNOTATION_NODE_POOL, ANNOTATION_PAUSED,
    ANNOTATION_PLATFORM_MACHINE_TEMPLATE,
};
use crate::platform::{self, PlatformAdapter};

const FIELD_MANAGER: &str = "hypershift-nodepool-operator";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("platform adapter failed: {source}"))]
    Platform { source: platform::Error },
    #[snafu(display("failed to serialize machine template spec: {source}"))]
    SerializeTemplate { source: serde_json::Error },
    #[snafu(display("failed to list machine templates: {source}"))]
    ListTemplates { source: kube::Error },
    #[snafu(display("failed to apply machine template {name}: {source}"))]
    ApplyTemplate { name: String, source: kube::Error },
    #[snafu(display("failed to delete stale machine template {name}: {source}"))]
    DeleteTemplate { name: String, source: kube::Error },
    #[snafu(display("failed to list MachineSets: {source}"))]
    ListMachineSets { source: kube::Error },
    #[snafu(display("failed to list MachineDeployments: {source}"))]
    ListMachineDeployments { source: kube::Error },
    #[snafu(display("failed to list Machines: {source}"))]
    ListMachines { source: kube::Error },
    #[snafu(display("failed to apply MachineDeployment: {source}"))]
    ApplyMachineDeployment { source: kube::Error },
    #[snafu(display("failed to apply MachineSet: {source}"))]
    ApplyMachineSet { source: kube::Error },
    #[snafu(display("failed to apply MachineHealthCheck: {source}"))]
    ApplyMachineHealthCheck { source: kube::Error },
    #[snafu(display("failed to delete MachineHealthCheck: {source}"))]
    DeleteMachineHealthCheck { source: kube::Error },
    #[snafu(display("failed to patch paused annotation on {name}: {source}"))]
    PatchPausedAnnotation { name: String, source: kube::Error },
    #[snafu(display("failed to serialize managed taints: {source}"))]
    SerializeMachineTaints { source: serde_json::Error },
    #[snafu(display("failed to patch Machine {name}: {source}"))]
    PatchMachine { name: String, source: kube::Error },
    #[snafu(display("in-place upgrade execution failed: {source}"))]
    InPlaceExecution { source: inplace::Error },
}

/// Outcome handed back to the reconciler shell for status bubble-up.
pub struct RolloutOutcome {
    pub available_replicas: Option<i32>,
    pub ready_condition: (bool, String, String),
    pub updating_platform_machine_template: (bool, &'static str, String),
    pub machines: Vec<Machine>,
}

/// Deterministic machine-template name (spec §4.3): hash of the serialized spec plus
/// the node-pool back-reference, so an unchanged template never gets a new name (which
/// would otherwise force a spurious rollout every reconcile).
fn template_name(node_pool: &NodePool, spec: &Value) -> Result<String, Error> {
    let serialized = serde_json::to_string(spec).context(SerializeTemplateSnafu)?;
    let mut hasher = FnvHasher::with_key(0);
    hasher.write(serialized.as_bytes());
    hasher.write(node_pool.back_reference().as_bytes());
    Ok(format!(
        "{}-{:08x}",
        node_pool.name_any(),
        hasher.finish() & 0xffff_ffff
    ))
}

#[allow(clippy::too_many_arguments)]
pub async fn reconcile(
    client: &Client,
    control_plane_namespace: &str,
    node_pool: &NodePool,
    hosted_cluster: &HostedCluster,
    release: &dyn ReleaseImage,
    user_data_secret_name: &str,
    hash: &str,
    in_place_payload: &str,
) -> Result<RolloutOutcome, Error> {
    let adapter = platform::adapter_for(node_pool);
    let platform_kind = node_pool.spec.platform.kind();
    let (gvk, plural) = platform::machine_template_gvk(platform_kind);

    let template_spec = adapter
        .build_machine_template_spec(node_pool, hosted_cluster, release)
        .context(PlatformSnafu)?;
    let name = template_name(node_pool, &template_spec)?;

    let api_resource = kube::core::ApiResource::from_gvk_with_plural(&gvk, plural);
    let templates: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), control_plane_namespace, &api_resource);

    garbage_collect_stale_templates(client, control_plane_namespace, &api_resource, node_pool, &name).await?;

    let mut desired = DynamicObject::new(&name, &api_resource).within(control_plane_namespace);
    desired.metadata.annotations =
        Some([(ANNOTATION_NODE_POOL.to_string(), node_pool.back_reference())].into());
    desired.data = serde_json::json!({ "spec": template_spec });

    templates
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Apply(&desired),
        )
        .await
        .context(ApplyTemplateSnafu { name: name.clone() })?;

    let recorded_template = node_pool
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_PLATFORM_MACHINE_TEMPLATE));
    let updating_platform_machine_template =
        replace::updating_platform_machine_template(recorded_template.map(String::as_str), &name);

    let template_ref = ObjectReference {
        api_version: Some(format!("{}/{}", gvk.group, gvk.version)),
        kind: Some(gvk.kind.clone()),
        name: Some(name.clone()),
        namespace: Some(control_plane_namespace.to_string()),
        ..Default::default()
    };

    let (available_replicas, ready_condition) = match node_pool.spec.management.upgrade_type {
        UpgradeType::Replace => {
            reconcile_machine_deployment(
                client,
                control_plane_namespace,
                node_pool,
                &template_ref,
                user_data_secret_name,
                hash,
            )
            .await?
        }
        UpgradeType::InPlace => {
            reconcile_machine_set(
                client,
                control_plane_namespace,
                node_pool,
                hosted_cluster,
                &template_ref,
                user_data_secret_name,
                hash,
                in_place_payload,
            )
            .await?
        }
    };

    let machines = list_machines(client, control_plane_namespace, node_pool).await?;

    reconcile_health_check(client, control_plane_namespace, node_pool, hosted_cluster, &machines).await?;

    Ok(RolloutOutcome {
        available_replicas,
        ready_condition,
        updating_platform_machine_template,
        machines,
    })
}

/// Stamps (or clears) `ANNOTATION_PAUSED` on the NodePool's own MachineDeployment/MachineSet
/// (spec §6, §8 scenario 6): the CAPI controllers read this annotation directly, so a
/// paused NodePool must fan the pause out to whichever downstream resource already exists
/// rather than only recording its own `ReconciliationActive` condition. A no-op if the
/// resource hasn't been created yet — there's nothing downstream to pause.
pub async fn patch_paused_annotation(
    client: &Client,
    control_plane_namespace: &str,
    node_pool: &NodePool,
    paused: bool,
) -> Result<(), Error> {
    let name = node_pool.name_any();
    let value = if paused {
        serde_json::Value::String("true".to_string())
    } else {
        serde_json::Value::Null
    };
    let patch = serde_json::json!({ "metadata": { "annotations": { ANNOTATION_PAUSED: value } } });

    match node_pool.spec.management.upgrade_type {
        UpgradeType::Replace => {
            let api: Api<MachineDeployment> = Api::namespaced(client.clone(), control_plane_namespace);
            if api.get_opt(&name).await.context(PatchPausedAnnotationSnafu { name: name.clone() })?.is_none() {
                return Ok(());
            }
            api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await
                .context(PatchPausedAnnotationSnafu { name })?;
        }
        UpgradeType::InPlace => {
            let api: Api<MachineSet> = Api::namespaced(client.clone(), control_plane_namespace);
            if api.get_opt(&name).await.context(PatchPausedAnnotationSnafu { name: name.clone() })?.is_none() {
                return Ok(());
            }
            api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await
                .context(PatchPausedAnnotationSnafu { name })?;
        }
    }
    Ok(())
}

async fn garbage_collect_stale_templates(
    client: &Client,
    control_plane_namespace: &str,
    api_resource: &kube::core::ApiResource,
    node_pool: &NodePool,
    current_name: &str,
) -> Result<(), Error> {
    let templates: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), control_plane_namespace, api_resource);
    let machine_sets: Api<MachineSet> = Api::namespaced(client.clone(), control_plane_namespace);
    let machine_deployments: Api<MachineDeployment> =
        Api::namespaced(client.clone(), control_plane_namespace);

    let owned_templates = templates
        .list(&ListParams::default())
        .await
        .context(ListTemplatesSnafu)?
        .items
        .into_iter()
        .filter(|obj| {
            obj.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_NODE_POOL))
                .map(|v| v == &node_pool.back_reference())
                .unwrap_or(false)
        });

    // A template can still be referenced by a MachineSet that hasn't been scaled down yet
    // (Replace rollouts) or by the MachineDeployment itself (InPlace rollouts) even after
    // the NodePool has moved its own annotation on to a newer template.
    let mut referenced: std::collections::HashSet<String> = machine_sets
        .list(&ListParams::default())
        .await
        .context(ListMachineSetsSnafu)?
        .items
        .into_iter()
        .filter_map(|ms| ms.spec.template.spec.infrastructure_ref.name)
        .collect();
    referenced.extend(
        machine_deployments
            .list(&ListParams::default())
            .await
            .context(ListMachineDeploymentsSnafu)?
            .items
            .into_iter()
            .filter_map(|md| md.spec.template.spec.infrastructure_ref.name),
    );

    for template in owned_templates {
        let template_name = template.name_any();
        if template_name != current_name && !referenced.contains(&template_name) {
            templates
                .delete(&template_name, &Default::default())
                .await
                .context(DeleteTemplateSnafu { name: template_name })?;
        }
    }
    Ok(())
}

async fn reconcile_machine_deployment(
    client: &Client,
    control_plane_namespace: &str,
    node_pool: &NodePool,
    template_ref: &ObjectReference,
    user_data_secret_name: &str,
    hash: &str,
) -> Result<(Option<i32>, (bool, String, String)), Error> {
    let api: Api<MachineDeployment> = Api::namespaced(client.clone(), control_plane_namespace);
    let name = node_pool.name_any();

    let observed = api.get_opt(&name).await.context(ApplyMachineDeploymentSnafu)?;
    let current_replicas = observed.as_ref().and_then(|md| md.spec.replicas);

    let spec = replace::build_desired(
        node_pool,
        &name,
        control_plane_namespace,
        template_ref,
        user_data_secret_name,
        hash,
        current_replicas,
    );

    let mut desired = MachineDeployment::new(&name, spec);
    desired.metadata.annotations =
        Some([(ANNOTATION_NODE_POOL.to_string(), node_pool.back_reference())].into());

    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Apply(&desired),
    )
    .await
    .context(ApplyMachineDeploymentSnafu)?;

    let ready = observed
        .as_ref()
        .and_then(|md| md.status.as_ref())
        .map(replace::ready_condition_from)
        .unwrap_or((false, "Unknown".to_string(), String::new()));
    let available_replicas = observed
        .as_ref()
        .and_then(|md| md.status.as_ref())
        .and_then(|s| s.available_replicas);

    propagate_labels_and_taints(client, control_plane_namespace, node_pool).await?;

    Ok((available_replicas, ready))
}

/// Applies `replace::machine_label_patch`/`machine_taint_annotation` directly onto every
/// Machine already owned by this NodePool (spec §4.4), so label/taint-only spec changes
/// never need to touch the MachineDeployment template and therefore never trigger a
/// rolling upgrade.
async fn propagate_labels_and_taints(
    client: &Client,
    control_plane_namespace: &str,
    node_pool: &NodePool,
) -> Result<(), Error> {
    let machines = list_machines(client, control_plane_namespace, node_pool).await?;
    if machines.is_empty() {
        return Ok(());
    }

    let labels = replace::machine_label_patch(node_pool);
    let (taint_key, taint_value) =
        replace::machine_taint_annotation(node_pool).context(SerializeMachineTaintsSnafu)?;

    let api: Api<Machine> = Api::namespaced(client.clone(), control_plane_namespace);
    for machine in machines {
        let name = machine.name_any();
        let patch = serde_json::json!({
            "metadata": {
                "labels": labels,
                "annotations": { taint_key.clone(): taint_value.clone() },
            }
        });
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .context(PatchMachineSnafu { name })?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn reconcile_machine_set(
    client: &Client,
    control_plane_namespace: &str,
    node_pool: &NodePool,
    hosted_cluster: &HostedCluster,
    template_ref: &ObjectReference,
    user_data_secret_name: &str,
    hash: &str,
    payload: &str,
) -> Result<(Option<i32>, (bool, String, String)), Error> {
    let api: Api<MachineSet> = Api::namespaced(client.clone(), control_plane_namespace);
    let name = node_pool.name_any();

    let observed = api.get_opt(&name).await.context(ApplyMachineSetSnafu)?;
    let current_replicas = observed.as_ref().and_then(|ms| ms.spec.replicas);

    let spec = inplace::build_desired(node_pool, template_ref, user_data_secret_name, hash, current_replicas);

    let mut desired = MachineSet::new(&name, spec);
    let observed_annotations = observed
        .as_ref()
        .and_then(|ms| ms.metadata.annotations.clone())
        .unwrap_or_default();
    let config_version = inplace::resolve_config_version(hash, &observed_annotations);
    let total = current_replicas.unwrap_or_else(|| node_pool.desired_replicas());
    let (max_unavailable_key, max_unavailable_value) = inplace::max_unavailable_annotation(node_pool, total);
    let max_unavailable = inplace::resolve_max_unavailable(node_pool, total);

    let machines = list_machines(client, control_plane_namespace, node_pool).await?;
    let execution = inplace::execute(
        client,
        control_plane_namespace,
        &hosted_cluster.name_any(),
        node_pool,
        &machines,
        &config_version.target_config_version,
        config_version.current_config_version.as_deref(),
        max_unavailable,
        payload,
    )
    .await
    .context(InPlaceExecutionSnafu)?;

    let current_config_version = execution
        .completed_config_version
        .or(config_version.current_config_version);

    let mut annotations = std::collections::BTreeMap::new();
    annotations.insert(ANNOTATION_NODE_POOL.to_string(), node_pool.back_reference());
    annotations.insert(
        crate::crd::capi::ANNOTATION_TARGET_CONFIG_VERSION.to_string(),
        config_version.target_config_version,
    );
    if let Some(current) = current_config_version {
        annotations.insert(
            crate::crd::capi::ANNOTATION_CURRENT_CONFIG_VERSION.to_string(),
            current,
        );
    }
    annotations.insert(max_unavailable_key.to_string(), max_unavailable_value);
    if let Some(reason) = &execution.upgrade_in_progress {
        annotations.insert(
            crate::crd::capi::ANNOTATION_UPGRADE_IN_PROGRESS.to_string(),
            reason.clone(),
        );
    }
    desired.metadata.annotations = Some(annotations);

    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Apply(&desired),
    )
    .await
    .context(ApplyMachineSetSnafu)?;

    let (updating, reason, message) =
        inplace::upgrade_in_progress_condition(execution.upgrade_in_progress.as_deref());
    let ready = (updating, reason.to_string(), message);

    let available_replicas = observed
        .as_ref()
        .and_then(|ms| ms.status.as_ref())
        .and_then(|s| s.available_replicas);

    Ok((available_replicas, ready))
}

async fn list_machines(
    client: &Client,
    control_plane_namespace: &str,
    node_pool: &NodePool,
) -> Result<Vec<Machine>, Error> {
    let api: Api<Machine> = Api::namespaced(client.clone(), control_plane_namespace);
    let all = api
        .list(&ListParams::default())
        .await
        .context(ListMachinesSnafu)?;
    Ok(all
        .items
        .into_iter()
        .filter(|m| {
            m.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_NODE_POOL))
                .map(|v| v == &node_pool.back_reference())
                .unwrap_or(false)
        })
        .collect())
}

async fn reconcile_health_check(
    client: &Client,
    control_plane_namespace: &str,
    node_pool: &NodePool,
    hosted_cluster: &HostedCluster,
    _machines: &[Machine],
) -> Result<(), Error> {
    let api: Api<MachineHealthCheck> = Api::namespaced(client.clone(), control_plane_namespace);
    let name = node_pool.name_any();

    let reached_ignition_endpoint = hosted_cluster.status.as_ref().is_some_and(|s| s.ignition_endpoint.is_some());

    if !node_pool.spec.auto_repair || !reached_ignition_endpoint {
        match api.delete(&name, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(source) => return Err(Error::DeleteMachineHealthCheck { source }),
        }
        return Ok(());
    }

    let platform_kind = node_pool.spec.platform.kind();
    let unhealthy_timeout = platform_kind.default_unhealthy_timeout();

    let spec = MachineHealthCheckSpec {
        cluster_name: node_pool.spec.cluster_name.clone(),
        selector: k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
            match_labels: Some(
                [(
                    "cluster.x-k8s.io/cluster-name".to_string(),
                    node_pool.spec.cluster_name.clone(),
                )]
                .into(),
            ),
            ..Default::default()
        },
        unhealthy_conditions: vec![
            UnhealthyCondition {
                type_: "Ready".to_string(),
                status: "False".to_string(),
                timeout: format!("{}s", unhealthy_timeout.as_secs()),
            },
            UnhealthyCondition {
                type_: "Ready".to_string(),
                status: "Unknown".to_string(),
                timeout: format!("{}s", unhealthy_timeout.as_secs()),
            },
        ],
        max_unhealthy: k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(2),
        node_startup_timeout: "1200s".to_string(),
    };

    let mut desired = MachineHealthCheck::new(&name, spec);
    desired.metadata.annotations =
        Some([(ANNOTATION_NODE_POOL.to_string(), node_pool.back_reference())].into());

    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Apply(&desired),
    )
    .await
    .context(ApplyMachineHealthCheckSnafu)?;
    Ok(())
}
