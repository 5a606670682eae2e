//! Guest-cluster client bootstrap for the in-place upgrader (spec §5): Nodes and the
//! per-Node reconfigure Pod live in the workload cluster, not the management cluster the
//! rest of this operator talks to. The client for a given HostedCluster is built once
//! from its admin-kubeconfig Secret and cached behind a process-local mutex, keyed by
//! control-plane namespace (one HostedCluster per namespace).

use std::collections::HashMap;
use std::sync::Mutex;

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use once_cell::sync::Lazy;
use snafu::{OptionExt, ResultExt, Snafu};

const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

static GUEST_CLIENTS: Lazy<Mutex<HashMap<String, Client>>> = Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get guest kubeconfig Secret {name}: {source}"))]
    GetKubeconfigSecret { name: String, source: kube::Error },
    #[snafu(display("guest kubeconfig Secret {name} has no {KUBECONFIG_SECRET_KEY} key"))]
    MissingKubeconfigKey { name: String },
    #[snafu(display("guest kubeconfig Secret {name} is not valid UTF-8: {source}"))]
    InvalidKubeconfigEncoding { name: String, source: std::str::Utf8Error },
    #[snafu(display("failed to parse guest kubeconfig: {source}"))]
    ParseKubeconfig { source: serde_yaml::Error },
    #[snafu(display("failed to build guest cluster client config: {source}"))]
    BuildConfig { source: kube::config::KubeconfigError },
    #[snafu(display("failed to build guest cluster client: {source}"))]
    BuildClient { source: kube::Error },
}

/// Returns the cached `Client` for the HostedCluster backing `control_plane_namespace`,
/// bootstrapping and caching one from its admin-kubeconfig Secret on first use. A failed
/// bootstrap never inserts into the cache, so the slot is free for the next reconcile to
/// retry.
pub async fn client_for(
    management_client: &Client,
    control_plane_namespace: &str,
    hosted_cluster_name: &str,
) -> Result<Client, Error> {
    if let Some(cached) = GUEST_CLIENTS.lock().unwrap().get(control_plane_namespace).cloned() {
        return Ok(cached);
    }

    let secret_name = format!("{hosted_cluster_name}-admin-kubeconfig");
    let secrets: Api<Secret> = Api::namespaced(management_client.clone(), control_plane_namespace);
    let secret = secrets
        .get(&secret_name)
        .await
        .context(GetKubeconfigSecretSnafu { name: secret_name.clone() })?;
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(KUBECONFIG_SECRET_KEY))
        .context(MissingKubeconfigKeySnafu { name: secret_name.clone() })?;
    let text = std::str::from_utf8(&bytes.0)
        .context(InvalidKubeconfigEncodingSnafu { name: secret_name.clone() })?;
    let kubeconfig: Kubeconfig = serde_yaml::from_str(text).context(ParseKubeconfigSnafu)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context(BuildConfigSnafu)?;
    let guest_client = Client::try_from(config).context(BuildClientSnafu)?;

    GUEST_CLIENTS
        .lock()
        .unwrap()
        .insert(control_plane_namespace.to_string(), guest_client.clone());
    Ok(guest_client)
}
