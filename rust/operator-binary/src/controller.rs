//! Reconciler Shell (spec §4, §7): the thin glue that wires every pure-function
//! component (config generator, token manager, platform adapter, rollout engine,
//! conditions engine) into the single callback `kube::runtime::Controller` drives.
//!
//! Finalizer add/remove is grounded on `other_examples`'
//! `3bc35b31_pando85-echo-operator-rs__libs-operator-src-controller.rs.rs`
//! (`kube::runtime::finalizer`), since the teacher's own Hive controller never shows a
//! deletion path in the retrieved files.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{self, Event as FinalizerEvent};
use kube::{Client, ResourceExt};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::conditions::{self, NodePoolConditionType};
use crate::config::generator::{self, ReleaseImage};
use crate::config::RuntimeConfig;
use crate::crd::hosted_cluster::HostedCluster;
use crate::crd::{
    self, NodePool, NodePoolStatus, ANNOTATION_CURRENT_CONFIG, ANNOTATION_CURRENT_CONFIG_VERSION,
    ANNOTATION_PLATFORM_MACHINE_TEMPLATE,
};
use crate::platform;
use crate::rollout;
use crate::token;

pub const FIELD_MANAGER: &str = "hypershift-nodepool-operator";
pub const FULL_CONTROLLER_NAME: &str = "nodepool.hypershift.openshift.io";
const FINALIZER: &str = "hypershift.openshift.io/nodepool";

pub struct Ctx {
    pub client: Client,
    pub runtime_config: RuntimeConfig,
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Validate { source: crd::Error },
    #[snafu(display("failed to fetch HostedCluster {name}: {source}"))]
    GetHostedCluster { name: String, source: kube::Error },
    #[snafu(display("HostedCluster {name} has not published an ignition endpoint yet"))]
    NoIgnitionEndpoint { name: String },
    #[snafu(display("failed to fetch ignition root CA from Secret {name}: {source}"))]
    GetIgnitionCa { name: String, source: kube::Error },
    #[snafu(display("ignition root CA Secret {name} has no ca.crt key"))]
    MissingIgnitionCa { name: String },
    #[snafu(display("config generator: {source}"))]
    Generate { source: generator::Error },
    #[snafu(display("token manager: {source}"))]
    Token { source: token::Error },
    #[snafu(display("rollout engine: {source}"))]
    Rollout { source: rollout::Error },
    #[snafu(display("failed to apply Secret {name}: {source}"))]
    ApplySecret { name: String, source: kube::Error },
    #[snafu(display("failed to delete outdated Secret {name}: {source}"))]
    DeleteSecret { name: String, source: kube::Error },
    #[snafu(display("failed to mark Secret {name} for expiry: {source}"))]
    ExpireSecret { name: String, source: kube::Error },
    #[snafu(display("failed to patch NodePool annotations: {source}"))]
    PatchAnnotations { source: kube::Error },
    #[snafu(display("failed to patch NodePool status: {source}"))]
    ApplyStatus { source: kube::Error },
    #[snafu(display("finalizer error: {source}"))]
    Finalizer {
        source: Box<finalizer::Error<Error>>,
    },
}

pub async fn reconcile(node_pool: Arc<NodePool>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let namespace = node_pool.namespace_or_err().context(ValidateSnafu)?;
    let api: Api<NodePool> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer::finalizer(&api, FINALIZER, node_pool, |event| async {
        match event {
            FinalizerEvent::Apply(np) => reconcile_apply(np, &ctx).await,
            FinalizerEvent::Cleanup(np) => reconcile_cleanup(np, &ctx).await,
        }
    })
    .await
    .map_err(|source| Error::Finalizer {
        source: Box::new(source),
    })
}

pub fn error_policy(_node_pool: Arc<NodePool>, _error: &Error, _ctx: Arc<Ctx>) -> Action {
    Action::requeue(Duration::from_secs(10))
}

/// `<hostedcluster-namespace>-<hostedcluster-name>` (spec §3): the namespace holding the
/// control-plane components a NodePool rolls out against.
fn control_plane_namespace(hosted_cluster: &HostedCluster) -> String {
    format!(
        "{}-{}",
        hosted_cluster.metadata.namespace.as_deref().unwrap_or_default(),
        hosted_cluster.name_any()
    )
}

async fn reconcile_apply(node_pool: Arc<NodePool>, ctx: &Ctx) -> Result<Action, Error> {
    let namespace = node_pool.namespace_or_err().context(ValidateSnafu)?;

    let hosted_cluster_api: Api<HostedCluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let hosted_cluster = hosted_cluster_api
        .get(&node_pool.spec.cluster_name)
        .await
        .context(GetHostedClusterSnafu {
            name: node_pool.spec.cluster_name.clone(),
        })?;
    let control_plane_ns = control_plane_namespace(&hosted_cluster);

    let pause_state = node_pool.pause_state();
    let (active, reason, message) = conditions::reconciliation_active(&pause_state);
    if !active {
        rollout::patch_paused_annotation(&ctx.client, &control_plane_ns, &node_pool, true)
            .await
            .context(RolloutSnafu)?;
        patch_conditions_only(
            &node_pool,
            &ctx.client,
            &namespace,
            vec![(
                NodePoolConditionType::ReconciliationActive,
                active,
                reason.to_string(),
                message,
            )],
        )
        .await?;
        return Ok(Action::requeue(Duration::from_secs(30)));
    }
    rollout::patch_paused_annotation(&ctx.client, &control_plane_ns, &node_pool, false)
        .await
        .context(RolloutSnafu)?;

    let release = StaticRelease::from_image(&node_pool.spec.release.image);

    let rollout_config = generator::generate(
        &ctx.client,
        &control_plane_ns,
        &node_pool,
        &hosted_cluster,
        &release,
        None,
    )
    .await
    .context(GenerateSnafu)?;
    let hash = rollout_config.hash();

    let ignition_endpoint = hosted_cluster
        .status
        .as_ref()
        .and_then(|s| s.ignition_endpoint.as_deref())
        .context(NoIgnitionEndpointSnafu {
            name: node_pool.spec.cluster_name.clone(),
        })?;
    let ignition_ca_cert_b64 = fetch_ignition_ca_cert(&ctx.client, &control_plane_ns).await?;

    let previous_hash = node_pool
        .annotations()
        .get(ANNOTATION_CURRENT_CONFIG_VERSION)
        .map(String::as_str);

    let token_expiry_grace = chrono::Duration::from_std(ctx.runtime_config.token_expiry_grace)
        .unwrap_or_else(|_| chrono::Duration::hours(2));
    let token_outcome = token::reconcile(
        &node_pool,
        &rollout_config,
        &hash,
        previous_hash,
        ignition_endpoint,
        &ignition_ca_cert_b64,
        &control_plane_ns,
        token_expiry_grace,
    )
    .context(TokenSnafu)?;

    apply_secret(&ctx.client, &control_plane_ns, &token_outcome.token_secret).await?;
    apply_secret(&ctx.client, &control_plane_ns, &token_outcome.user_data_secret).await?;

    if let Some(name) = &token_outcome.outdated_user_data_secret_name {
        delete_secret(&ctx.client, &control_plane_ns, name).await?;
    }
    if let Some((name, expires_at)) = &token_outcome.outdated_token_secret {
        expire_secret(&ctx.client, &control_plane_ns, name, *expires_at).await?;
    }

    let (_, user_data_secret_name) = token::valid_secret_names(&node_pool, &hash);

    let outcome = rollout::reconcile(
        &ctx.client,
        &control_plane_ns,
        &node_pool,
        &hosted_cluster,
        &release,
        &user_data_secret_name,
        &hash,
        &rollout_config.mco_raw_config,
    )
    .await
    .context(RolloutSnafu)?;

    let mut annotations = std::collections::BTreeMap::new();
    annotations.insert(ANNOTATION_CURRENT_CONFIG_VERSION.to_string(), hash.clone());
    annotations.insert(
        ANNOTATION_CURRENT_CONFIG.to_string(),
        rollout_config.hash_without_version(),
    );
    if outcome.updating_platform_machine_template.0 {
        // still rolling out; don't record the new template name until it's current.
    } else if let Some(name) = node_pool.annotations().get(ANNOTATION_PLATFORM_MACHINE_TEMPLATE) {
        annotations.insert(ANNOTATION_PLATFORM_MACHINE_TEMPLATE.to_string(), name.clone());
    }
    patch_annotations(&node_pool, &ctx.client, &namespace, annotations).await?;

    let mut condition_updates = vec![
        (
            NodePoolConditionType::ReconciliationActive,
            active,
            reason.to_string(),
            message,
        ),
        (
            NodePoolConditionType::UpdatingPlatformMachineTemplate,
            outcome.updating_platform_machine_template.0,
            outcome.updating_platform_machine_template.1.to_string(),
            outcome.updating_platform_machine_template.2,
        ),
    ];
    let (ready, ready_reason, ready_message) = outcome.ready_condition;
    condition_updates.push((NodePoolConditionType::Ready, ready, ready_reason, ready_message));

    for platform_condition in platform::adapter_for(&node_pool).set_platform_conditions(&node_pool, &hosted_cluster) {
        if let Ok(type_) = platform_condition.type_.parse::<NodePoolConditionType>() {
            condition_updates.push((
                type_,
                platform_condition.status == "True",
                platform_condition.reason,
                platform_condition.message,
            ));
        }
    }

    let (healthy, healthy_reason, healthy_message) =
        conditions::all_machines_ready(&outcome.machines);
    condition_updates.push((NodePoolConditionType::AllMachinesReady, healthy, healthy_reason.to_string(), healthy_message));

    let (no_conflict, conflict_reason, conflict_message) = conditions::cluster_network_cidr_conflict(
        &outcome.machines,
        hosted_cluster.status.as_ref().and_then(|s| s.cluster_network_cidr.as_deref()),
    );
    condition_updates.push((
        NodePoolConditionType::ClusterNetworkCIDRConflict,
        no_conflict,
        conflict_reason.to_string(),
        conflict_message,
    ));

    apply_status(
        &node_pool,
        &ctx.client,
        &namespace,
        &release,
        outcome.available_replicas,
        condition_updates,
    )
    .await?;

    Ok(Action::requeue(Duration::from_secs(120)))
}

async fn reconcile_cleanup(node_pool: Arc<NodePool>, ctx: &Ctx) -> Result<Action, Error> {
    let namespace = node_pool.namespace_or_err().context(ValidateSnafu)?;
    let hosted_cluster_api: Api<HostedCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    let Ok(hosted_cluster) = hosted_cluster_api.get(&node_pool.spec.cluster_name).await else {
        // HostedCluster already gone; nothing left to clean up downstream.
        return Ok(Action::await_change());
    };
    let control_plane_ns = control_plane_namespace(&hosted_cluster);

    let machines_api: Api<crate::crd::capi::Machine> =
        Api::namespaced(ctx.client.clone(), &control_plane_ns);
    let remaining = machines_api
        .list(&kube::api::ListParams::default())
        .await
        .map(|l| {
            l.items
                .into_iter()
                .filter(|m| {
                    m.metadata
                        .annotations
                        .as_ref()
                        .and_then(|a| a.get(crate::crd::ANNOTATION_NODE_POOL))
                        .map(|v| v == &node_pool.back_reference())
                        .unwrap_or(false)
                })
                .count()
        })
        .unwrap_or(0);

    if remaining > 0 {
        return Ok(Action::requeue(Duration::from_secs(15)));
    }

    Ok(Action::await_change())
}

async fn apply_secret(client: &Client, namespace: &str, secret: &Secret) -> Result<(), Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let name = secret.metadata.name.clone().unwrap_or_default();
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(secret))
        .await
        .context(ApplySecretSnafu { name })?;
    Ok(())
}

async fn delete_secret(client: &Client, namespace: &str, name: &str) -> Result<(), Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(source) => Err(Error::DeleteSecret {
            name: name.to_string(),
            source,
        }),
    }
}

/// Sets the token-Secret's expiration annotation instead of deleting it outright (spec
/// §4.2/§4.8): the Secret Janitor owns the actual delete once the grace period elapses.
async fn expire_secret(
    client: &Client,
    namespace: &str,
    name: &str,
    expires_at: chrono::DateTime<chrono::Utc>,
) -> Result<(), Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({
        "metadata": {
            "annotations": {
                token::ANNOTATION_TOKEN_EXPIRATION: expires_at.to_rfc3339(),
            }
        }
    });
    match api
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(source) => Err(Error::ExpireSecret {
            name: name.to_string(),
            source,
        }),
    }
}

async fn fetch_ignition_ca_cert(client: &Client, control_plane_ns: &str) -> Result<String, Error> {
    const ROOT_CA_SECRET: &str = "root-ca";
    const ROOT_CA_KEY: &str = "ca.crt";

    let api: Api<Secret> = Api::namespaced(client.clone(), control_plane_ns);
    let secret = api.get(ROOT_CA_SECRET).await.context(GetIgnitionCaSnafu {
        name: ROOT_CA_SECRET.to_string(),
    })?;
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(ROOT_CA_KEY))
        .context(MissingIgnitionCaSnafu {
            name: ROOT_CA_SECRET.to_string(),
        })?;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    Ok(STANDARD.encode(&bytes.0))
}

async fn patch_conditions_only(
    node_pool: &NodePool,
    client: &Client,
    namespace: &str,
    updates: Vec<(NodePoolConditionType, bool, String, String)>,
) -> Result<(), Error> {
    let api: Api<NodePool> = Api::namespaced(client.clone(), namespace);
    let mut conditions = node_pool
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    for (type_, status, reason, message) in updates {
        conditions::set_status_condition(&mut conditions, type_, status, &reason, &message, node_pool.meta().generation);
    }
    let patch = serde_json::json!({ "status": { "conditions": conditions } });
    api.patch_status(
        &node_pool.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .context(ApplyStatusSnafu)?;
    Ok(())
}

async fn patch_annotations(
    node_pool: &NodePool,
    client: &Client,
    namespace: &str,
    annotations: std::collections::BTreeMap<String, String>,
) -> Result<(), Error> {
    let api: Api<NodePool> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
    api.patch(
        &node_pool.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .context(PatchAnnotationsSnafu)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn apply_status(
    node_pool: &NodePool,
    client: &Client,
    namespace: &str,
    release: &StaticRelease,
    available_replicas: Option<i32>,
    updates: Vec<(NodePoolConditionType, bool, String, String)>,
) -> Result<(), Error> {
    let api: Api<NodePool> = Api::namespaced(client.clone(), namespace);
    let mut conditions: Vec<Condition> = node_pool
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    for (type_, status, reason, message) in updates {
        conditions::set_status_condition(
            &mut conditions,
            type_,
            status,
            &reason,
            &message,
            node_pool.meta().generation,
        );
    }

    let status = NodePoolStatus {
        version: Some(release.version.clone()),
        replicas: available_replicas.or_else(|| node_pool.status.as_ref().and_then(|s| s.replicas)),
        conditions,
    };
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &node_pool.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .context(ApplyStatusSnafu)?;
    Ok(())
}

/// Minimal `ReleaseImage` built straight from `spec.release.image` (spec §1: "consumed
/// via interfaces"): this controller has no release-payload inspector of its own, so the
/// version is only as good as the tag the user wrote, and AMI resolution always falls
/// through to `spec.ami` on platforms that need an explicit override.
struct StaticRelease {
    reference: String,
    version: String,
}

impl StaticRelease {
    fn from_image(image: &str) -> Self {
        let version = image
            .rsplit(':')
            .next()
            .filter(|v| !v.is_empty())
            .unwrap_or("latest")
            .to_string();
        StaticRelease {
            reference: image.to_string(),
            version,
        }
    }
}

impl ReleaseImage for StaticRelease {
    fn reference(&self) -> &str {
        &self.reference
    }
    fn version(&self) -> &str {
        &self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_release_parses_tag_as_version() {
        let release = StaticRelease::from_image("quay.io/openshift-release-dev/ocp-release:4.18.1-x86_64");
        assert_eq!(release.version(), "4.18.1-x86_64");
        assert_eq!(release.reference(), "quay.io/openshift-release-dev/ocp-release:4.18.1-x86_64");
    }

    #[test]
    fn static_release_falls_back_when_untagged() {
        let release = StaticRelease::from_image("quay.io/openshift-release-dev/ocp-release");
        assert_eq!(release.version(), "latest");
    }

    #[test]
    fn control_plane_namespace_follows_convention() {
        let hc = HostedCluster::new(
            "example",
            crate::crd::hosted_cluster::HostedClusterSpec {
                pull_secret: crate::crd::hosted_cluster::LocalObjectReference {
                    name: "pull".into(),
                },
                additional_trust_bundle: None,
                configuration: None,
                platform: None,
            },
        );
        let mut hc = hc;
        hc.metadata.namespace = Some("clusters".to_string());
        assert_eq!(control_plane_namespace(&hc), "clusters-example");
    }
}
