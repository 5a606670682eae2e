//! Token Manager (spec §4.2): owns the {token-Secret, user-data-Secret} pair keyed by
//! `Hash`, synchronously within one reconcile — spec §4.2 pins this down explicitly, so
//! unlike the rollout engine there is no background worker here.
//!
//! Secret building follows the teacher's `ConfigMapBuilder` idiom
//! (`controller.rs::build_metastore_rolegroup_config_map`) applied to `Secret` instead of
//! `ConfigMap`; metadata is a plain `ObjectMeta` literal rather than `ObjectMetaBuilder`
//! since these Secrets live in the control-plane namespace rather than the owning
//! NodePool's own namespace, which the builder's `name_and_namespace` assumes.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use snafu::{ResultExt, Snafu};
use uuid::Uuid;

use crate::config::generator::{self, RolloutConfig};
use crate::crd::platform::Platform;
use crate::crd::{NodePool, ANNOTATION_NODE_POOL};

pub const ANNOTATION_IGNITION_CONFIG: &str = "hypershift.openshift.io/ignition-config";
pub const ANNOTATION_UPGRADE_TYPE: &str = "hypershift.openshift.io/node-pool-upgrade-type";
pub const ANNOTATION_LAST_TOKEN_GENERATION_TIME: &str =
    "hypershift.openshift.io/last-token-generation-time";
pub const ANNOTATION_TOKEN_EXPIRATION: &str =
    "hypershift.openshift.io/ignition-server-token-expiration-timestamp";

pub const KEY_TOKEN: &str = "token";
pub const KEY_RELEASE: &str = "release";
pub const KEY_CONFIG: &str = "config";
pub const KEY_PULL_SECRET_HASH: &str = "pull-secret-hash";
pub const KEY_HC_CONFIGURATION_HASH: &str = "hc-configuration-hash";
pub const KEY_TRUST_BUNDLE_HASH: &str = "additional-trust-bundle-hash";

pub const KEY_USER_DATA_VALUE: &str = "value";
pub const KEY_DISABLE_TEMPLATING: &str = "disableTemplating";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to compress OS-config payload: {source}"))]
    Compress { source: generator::Error },
    #[snafu(display("failed to serialize user-data ignition pointer: {source}"))]
    SerializeUserData { source: serde_json::Error },
}

/// Deterministic names for the currently-valid token-Secret/user-data-Secret pair for a
/// given `Hash`. Shared between the Token Manager and the Secret Janitor (spec §4.8,
/// §9 "same algorithm" requirement) so the invariant can't drift between the two.
pub fn valid_secret_names(node_pool: &NodePool, hash: &str) -> (String, String) {
    let name = node_pool_name(node_pool);
    (
        format!("token-{name}-{hash}"),
        format!("user-data-{name}-{hash}"),
    )
}

fn node_pool_name(node_pool: &NodePool) -> String {
    kube::ResourceExt::name_any(node_pool)
}

/// The full token+user-data reconcile described in spec §4.2: clean the outdated
/// generation (unless the platform policy says to retain the user-data Secret), then
/// create-or-update the current generation.
pub struct TokenReconcile {
    pub token_secret: Secret,
    pub user_data_secret: Secret,
    /// Name of the outdated user-data-Secret that should be deleted, unless
    /// `retain_outdated_user_data` is set.
    pub outdated_user_data_secret_name: Option<String>,
    /// Name of the outdated token-Secret, together with its new expiration timestamp.
    pub outdated_token_secret: Option<(String, DateTime<Utc>)>,
}

#[allow(clippy::too_many_arguments)]
pub fn reconcile(
    node_pool: &NodePool,
    rollout_config: &RolloutConfig,
    hash: &str,
    previous_hash: Option<&str>,
    ignition_endpoint: &str,
    ignition_ca_cert_b64: &str,
    control_plane_namespace: &str,
    token_expiry_grace: chrono::Duration,
) -> Result<TokenReconcile, Error> {
    let platform = node_pool.spec.platform.kind();

    let (outdated_user_data_secret_name, outdated_token_secret) = match previous_hash {
        Some(previous_hash) if previous_hash != hash => {
            let (old_token_name, old_user_data_name) = valid_secret_names(node_pool, previous_hash);
            let expires_at = Utc::now() + token_expiry_grace;
            let keep_user_data = platform.retains_user_data_on_upgrade();
            (
                (!keep_user_data).then_some(old_user_data_name),
                Some((old_token_name, expires_at)),
            )
        }
        _ => (None, None),
    };

    let token = Uuid::new_v4().to_string();

    let token_secret =
        build_token_secret(node_pool, rollout_config, hash, &token, control_plane_namespace)?;
    let user_data_secret = build_user_data_secret(
        node_pool,
        hash,
        &token,
        ignition_endpoint,
        ignition_ca_cert_b64,
        control_plane_namespace,
    )?;

    Ok(TokenReconcile {
        token_secret,
        user_data_secret,
        outdated_user_data_secret_name,
        outdated_token_secret,
    })
}

fn build_token_secret(
    node_pool: &NodePool,
    rollout_config: &RolloutConfig,
    hash: &str,
    token: &str,
    control_plane_namespace: &str,
) -> Result<Secret, Error> {
    let (token_name, _) = valid_secret_names(node_pool, hash);
    let compressed_config = generator::compress_and_encode(&rollout_config.mco_raw_config)
        .context(CompressSnafu)?;

    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_IGNITION_CONFIG.to_string(), "true".to_string());
    annotations.insert(
        ANNOTATION_UPGRADE_TYPE.to_string(),
        node_pool.spec.management.upgrade_type.to_string(),
    );
    annotations.insert(ANNOTATION_NODE_POOL.to_string(), node_pool.back_reference());
    annotations.insert(
        ANNOTATION_LAST_TOKEN_GENERATION_TIME.to_string(),
        Utc::now().to_rfc3339(),
    );

    let mut data = BTreeMap::new();
    data.insert(
        KEY_TOKEN.to_string(),
        ByteString(token.to_string().into_bytes()),
    );
    data.insert(
        KEY_RELEASE.to_string(),
        ByteString(rollout_config.release_reference.clone().into_bytes()),
    );
    data.insert(
        KEY_CONFIG.to_string(),
        ByteString(compressed_config.into_bytes()),
    );
    data.insert(
        KEY_PULL_SECRET_HASH.to_string(),
        ByteString(short_hash(&rollout_config.pull_secret_name).into_bytes()),
    );
    data.insert(
        KEY_HC_CONFIGURATION_HASH.to_string(),
        ByteString(short_hash(&rollout_config.global_config_string).into_bytes()),
    );
    data.insert(
        KEY_TRUST_BUNDLE_HASH.to_string(),
        ByteString(
            short_hash(rollout_config.trust_bundle_name.as_deref().unwrap_or("")).into_bytes(),
        ),
    );

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(token_name),
            namespace: Some(control_plane_namespace.to_string()),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        },
        data: Some(data),
        string_data: None,
        immutable: None,
        type_: Some("Opaque".to_string()),
    })
}

fn build_user_data_secret(
    node_pool: &NodePool,
    hash: &str,
    token: &str,
    ignition_endpoint: &str,
    ignition_ca_cert_b64: &str,
    control_plane_namespace: &str,
) -> Result<Secret, Error> {
    let (_, user_data_name) = valid_secret_names(node_pool, hash);

    let pointer = IgnitionPointer {
        url: format!("https://{ignition_endpoint}/ignition"),
        ca_cert: ignition_ca_cert_b64.to_string(),
        headers: vec![
            IgnitionHeader {
                name: "Authorization".to_string(),
                value: format!("Bearer {}", BASE64.encode(token)),
            },
            IgnitionHeader {
                name: "NodePool".to_string(),
                value: node_pool.back_reference(),
            },
            IgnitionHeader {
                name: "TargetConfigVersionHash".to_string(),
                value: hash.to_string(),
            },
        ],
    };
    let pointer_json = serde_json::to_vec(&pointer).context(SerializeUserDataSnafu)?;

    let mut data = BTreeMap::new();
    data.insert(KEY_USER_DATA_VALUE.to_string(), ByteString(pointer_json));
    data.insert(
        KEY_DISABLE_TEMPLATING.to_string(),
        ByteString(BASE64.encode("true").into_bytes()),
    );

    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_NODE_POOL.to_string(), node_pool.back_reference());

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(user_data_name),
            namespace: Some(control_plane_namespace.to_string()),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        },
        data: Some(data),
        string_data: None,
        immutable: None,
        type_: Some("Opaque".to_string()),
    })
}

#[derive(serde::Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
struct IgnitionPointer {
    url: String,
    #[serde(rename = "caCert")]
    ca_cert: String,
    headers: Vec<IgnitionHeader>,
}

#[derive(serde::Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
struct IgnitionHeader {
    name: String,
    value: String,
}

fn short_hash(value: &str) -> String {
    use std::hash::Hasher;
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(value.as_bytes());
    format!("{:08x}", hasher.finish() & 0xffff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_secret_names_follow_naming_convention() {
        let np = crate::crd::NodePool::new(
            "workers",
            crate::crd::NodePoolSpec {
                cluster_name: "hc".into(),
                platform: crate::crd::platform::NodePoolPlatform::None,
                replicas: Some(1),
                auto_scaling: None,
                release: crate::crd::NodePoolReleaseImage {
                    image: "r1".into(),
                },
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
        let (token_name, user_data_name) = valid_secret_names(&np, "deadbeef");
        assert_eq!(token_name, "token-workers-deadbeef");
        assert_eq!(user_data_name, "user-data-workers-deadbeef");
    }

    #[test]
    fn aws_retains_user_data_on_upgrade() {
        assert!(Platform::Aws.retains_user_data_on_upgrade());
        assert!(!Platform::None.retains_user_data_on_upgrade());
    }

    #[test]
    fn short_hash_is_stable() {
        assert_eq!(short_hash("pull-secret"), short_hash("pull-secret"));
        assert_ne!(short_hash("pull-secret"), short_hash("other"));
    }

    #[test]
    fn user_data_secret_carries_bearer_token_matching_the_token_secret() {
        let np = crate::crd::NodePool::new(
            "workers",
            crate::crd::NodePoolSpec {
                cluster_name: "hc".into(),
                platform: crate::crd::platform::NodePoolPlatform::None,
                replicas: Some(1),
                auto_scaling: None,
                release: crate::crd::NodePoolReleaseImage {
                    image: "r1".into(),
                },
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

        let token = "abc123";
        let user_data_secret =
            build_user_data_secret(&np, "deadbeef", token, "ignition.example.com", "ca==", "clusters-example")
                .unwrap();
        let pointer_bytes = &user_data_secret.data.unwrap()[KEY_USER_DATA_VALUE].0;
        let pointer: IgnitionPointer = serde_json::from_slice(pointer_bytes).unwrap();

        let auth_header = pointer
            .headers
            .iter()
            .find(|h| h.name == "Authorization")
            .expect("Authorization header present");
        assert_eq!(auth_header.value, format!("Bearer {}", BASE64.encode(token)));
    }
}
