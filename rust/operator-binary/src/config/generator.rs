//! Config Generator (spec §4.1): merges core/user/tuning/HA-proxy OS-config documents
//! and the HostedCluster's cluster-wide configuration into one canonical,
//! deterministically-sorted `mcoRawConfig`, plus its two content-addressed fingerprints.
//!
//! Hashing follows the teacher's `controller.rs` `discovery_hash` idiom verbatim: an
//! `FnvHasher` rather than std's unstable `DefaultHasher`, because we don't need
//! cryptographic strength, only a short and stable fingerprint.

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::io::{Read, Write};

use fnv::FnvHasher;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ListParams};
use kube::Client;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::config::manifests::{self, Manifest};
use crate::crd::hosted_cluster::HostedCluster;
use crate::crd::NodePool;

/// Label carried by core (platform-produced) OS-config ConfigMaps in the control-plane
/// namespace (spec §4.1, §6).
pub const LABEL_CORE_IGNITION_CONFIG: &str = "hypershift.openshift.io/core-ignition-config";
/// Label carried by NTO-generated tuning ConfigMaps.
pub const LABEL_NTO_GENERATED: &str = "hypershift.openshift.io/nto-generated-machine-config";
/// Annotation on a tuning ConfigMap naming the NodePool it applies to.
pub const ANNOTATION_TUNING_NODE_POOL: &str = "hypershift.openshift.io/nodePool";
/// Key under which a user OS-config ConfigMap's payload is stored (spec §6).
pub const USER_CONFIG_KEY: &str = "config";

/// The number of core OS-config documents expected when no HA-proxy config is supplied
/// in-process and the HostedCluster declares no image-content sources (spec §4.1).
const BASE_EXPECTED_CORE_CONFIGS: usize = 3;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("expected {expected} core OS-config documents, observed {observed}"))]
    MissingCoreConfig { expected: usize, observed: usize },
    #[snafu(display("{count} user OS-config ConfigMap reference(s) could not be resolved: {names}"))]
    MissingUserConfig { count: usize, names: String },
    #[snafu(display("failed to list core OS-config ConfigMaps: {source}"))]
    ListCoreConfig { source: kube::Error },
    #[snafu(display("failed to list tuning ConfigMaps: {source}"))]
    ListTuningConfig { source: kube::Error },
    #[snafu(display("failed to fetch user ConfigMap {name}: {source}"))]
    GetUserConfig { name: String, source: kube::Error },
    #[snafu(display("failed to decode manifests in ConfigMap {name}: {source}"))]
    DecodeManifests {
        name: String,
        source: manifests::Error,
    },
    #[snafu(display("failed to serialize manifest: {source}"))]
    SerializeManifest { source: serde_json::Error },
    #[snafu(display("failed to gzip-compress mcoRawConfig: {source}"))]
    Compress { source: std::io::Error },
    #[snafu(display("failed to gzip-decompress payload: {source}"))]
    Decompress { source: std::io::Error },
}

/// External collaborator providing release-image metadata (spec §1: "consumed via
/// interfaces"). A trait so tests can supply a fixed double instead of resolving a real
/// release payload.
pub trait ReleaseImage: Send + Sync {
    /// The reference as written on the NodePool, e.g. `quay.io/.../ocp-release:4.18.1-x86_64`.
    fn reference(&self) -> &str;
    /// The semantic version extracted from the release, e.g. `4.18.1`.
    fn version(&self) -> &str;
    /// Looks up the AMI id for `region`+`arch` from the release payload's metadata, when
    /// the platform adapter needs to resolve one (spec §4.3 "AMI resolution"). `None`
    /// when this release carries no boot image for that region/arch pair.
    fn ami(&self, region: &str, arch: &str) -> Option<String> {
        let _ = (region, arch);
        None
    }
}

/// The minimal OS-config source abstraction the generator needs from the cluster,
/// implemented for `kube::Client` and, in tests, for an in-memory double.
#[async_trait::async_trait]
pub trait ConfigMapSource: Send + Sync {
    async fn list_labeled(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>, kube::Error>;
    async fn get(&self, namespace: &str, name: &str) -> Result<ConfigMap, kube::Error>;
}

#[async_trait::async_trait]
impl ConfigMapSource for Client {
    async fn list_labeled(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>, kube::Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.clone(), namespace);
        let lp = ListParams::default().labels(label_selector);
        Ok(api.list(&lp).await?.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<ConfigMap, kube::Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.clone(), namespace);
        api.get(name).await
    }
}

/// Derived, in-memory per-reconcile value (spec §3 `rolloutConfig`).
#[derive(Clone, Debug, PartialEq)]
pub struct RolloutConfig {
    pub release_reference: String,
    pub release_version: String,
    pub pull_secret_name: String,
    pub trust_bundle_name: Option<String>,
    pub global_config_string: String,
    pub mco_raw_config: String,
    pub haproxy_raw_config: Option<String>,
}

impl RolloutConfig {
    /// `Hash` (spec §4.1): identifies a rolloutable payload.
    pub fn hash(&self) -> String {
        let mut hasher = FnvHasher::with_key(0);
        hasher.write(self.mco_raw_config.as_bytes());
        hasher.write(self.release_version.as_bytes());
        hasher.write(self.pull_secret_name.as_bytes());
        hasher.write(self.trust_bundle_name.as_deref().unwrap_or("").as_bytes());
        hasher.write(self.global_config_string.as_bytes());
        format_hash(hasher.finish())
    }

    /// `HashWithoutVersion` (spec §4.1, §9 "hash input ordering quirk"): intentionally
    /// omits `globalConfigString`, unlike `hash()`. This asymmetry is historical and is
    /// kept behind this named function rather than inlined, per the design note.
    pub fn hash_without_version(&self) -> String {
        let mut hasher = FnvHasher::with_key(0);
        hasher.write(self.mco_raw_config.as_bytes());
        hasher.write(self.pull_secret_name.as_bytes());
        hasher.write(self.trust_bundle_name.as_deref().unwrap_or("").as_bytes());
        format_hash(hasher.finish())
    }
}

fn format_hash(value: u64) -> String {
    format!("{:08x}", value & 0xffff_ffff)
}

/// Gathers every input named in spec §4.1 and assembles the canonical `RolloutConfig`.
pub async fn generate(
    source: &dyn ConfigMapSource,
    control_plane_namespace: &str,
    node_pool: &NodePool,
    hosted_cluster: &HostedCluster,
    release: &dyn ReleaseImage,
    haproxy_raw_config: Option<&str>,
) -> Result<RolloutConfig, Error> {
    let has_haproxy = haproxy_raw_config.is_some();
    let has_icsp = hosted_cluster
        .spec
        .configuration
        .as_ref()
        .and_then(|c| c.image_content_sources.as_ref())
        .is_some_and(|v| !v.is_empty());

    let expected_core = BASE_EXPECTED_CORE_CONFIGS
        .saturating_sub(has_haproxy as usize)
        .saturating_add(has_icsp as usize);

    let core_label_selector = format!("{LABEL_CORE_IGNITION_CONFIG}=true");
    let core_config_maps = source
        .list_labeled(control_plane_namespace, &core_label_selector)
        .await
        .context(ListCoreConfigSnafu)?;
    ensure!(
        core_config_maps.len() == expected_core,
        MissingCoreConfigSnafu {
            expected: expected_core,
            observed: core_config_maps.len(),
        }
    );

    let mut missing_user: Vec<String> = Vec::new();
    let mut user_config_maps = Vec::new();
    let namespace = node_pool.namespace_or_err().unwrap_or_default();
    for config_ref in &node_pool.spec.config {
        match source.get(&namespace, &config_ref.name).await {
            Ok(cm) => user_config_maps.push(cm),
            Err(kube::Error::Api(e)) if e.code == 404 => missing_user.push(config_ref.name.clone()),
            Err(source) => {
                return Err(Error::GetUserConfig {
                    name: config_ref.name.clone(),
                    source,
                })
            }
        }
    }
    ensure!(
        missing_user.is_empty(),
        MissingUserConfigSnafu {
            count: missing_user.len(),
            names: missing_user.join(", "),
        }
    );

    let tuning_label_selector = format!("{LABEL_NTO_GENERATED}=true");
    let tuning_config_maps = source
        .list_labeled(control_plane_namespace, &tuning_label_selector)
        .await
        .context(ListTuningConfigSnafu)?
        .into_iter()
        .filter(|cm| {
            cm.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_TUNING_NODE_POOL))
                .map(|v| v == &node_pool.back_reference())
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    let mut manifests: Vec<Manifest> = Vec::new();
    for cm in core_config_maps
        .iter()
        .chain(user_config_maps.iter())
        .chain(tuning_config_maps.iter())
    {
        let name = cm.metadata.name.clone().unwrap_or_default();
        let payload = cm
            .data
            .as_ref()
            .and_then(|d| d.get(USER_CONFIG_KEY))
            .cloned()
            .unwrap_or_default();
        let decoded = manifests::decode_and_normalize(&payload, manifests.len())
            .context(DecodeManifestsSnafu { name })?;
        manifests.extend(decoded);
    }

    let mco_raw_config = assemble(&manifests)?;
    let global_config_string = global_config_string(hosted_cluster);

    Ok(RolloutConfig {
        release_reference: release.reference().to_string(),
        release_version: release.version().to_string(),
        pull_secret_name: hosted_cluster.spec.pull_secret.name.clone(),
        trust_bundle_name: hosted_cluster
            .spec
            .additional_trust_bundle
            .as_ref()
            .map(|r| r.name.clone()),
        global_config_string,
        mco_raw_config,
        haproxy_raw_config: haproxy_raw_config.map(str::to_string),
    })
}

/// Canonical-serializes every manifest, sorts lexicographically, and joins with
/// `\n---\n` (spec §4.1 "Assembly"). Sorting by the serialized bytes (not by name) is
/// what actually makes this invariant to ConfigMap iteration order.
fn assemble(manifests: &[Manifest]) -> Result<String, Error> {
    let mut serialized: Vec<String> = manifests
        .iter()
        .map(|m| serde_json::to_string(m).context(SerializeManifestSnafu))
        .collect::<Result<_, _>>()?;
    serialized.sort();
    Ok(serialized.join("\n---\n"))
}

/// Projects the HostedCluster's `Configuration` into the backward-compatible canonical
/// string (Open Question #1, DESIGN.md): proxy + image config only. Kept as a single
/// named function so widening the field set later is a one-function change.
pub fn global_config_string(hosted_cluster: &HostedCluster) -> String {
    let configuration = hosted_cluster.spec.configuration.clone().unwrap_or_default();
    let mut fields = BTreeMap::new();
    fields.insert(
        "proxy".to_string(),
        serde_json::to_value(configuration.proxy.unwrap_or_default()).unwrap_or_default(),
    );
    fields.insert(
        "image".to_string(),
        serde_json::to_value(configuration.image.unwrap_or_default()).unwrap_or_default(),
    );
    serde_json::to_string(&fields).unwrap_or_default()
}

/// Gzip-compresses `mcoRawConfig` (spec §4.1 "Compression").
pub fn compress(raw: &str) -> Result<Vec<u8>, Error> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw.as_bytes()).context(CompressSnafu)?;
    encoder.finish().context(CompressSnafu)
}

/// Gzip-compresses and base64-encodes `mcoRawConfig`, for downstream consumers that
/// advertise that capability (spec §4.1, §4.7).
pub fn compress_and_encode(raw: &str) -> Result<String, Error> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let compressed = compress(raw)?;
    Ok(STANDARD.encode(compressed))
}

/// Inverse of [`compress`], exercised by the round-trip test (spec §8).
pub fn decompress(compressed: &[u8]) -> Result<String, Error> {
    use flate2::read::GzDecoder;

    let mut decoder = GzDecoder::new(compressed);
    let mut out = String::new();
    decoder.read_to_string(&mut out).context(DecompressSnafu)?;
    Ok(out)
}

/// Inverse of [`compress_and_encode`].
pub fn decode_and_decompress(encoded: &str) -> Result<String, Error> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let compressed = STANDARD
        .decode(encoded)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid base64"))
        .context(DecompressSnafu)?;
    decompress(&compressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as StdMap;

    struct FixedRelease {
        reference: String,
        version: String,
    }

    impl ReleaseImage for FixedRelease {
        fn reference(&self) -> &str {
            &self.reference
        }
        fn version(&self) -> &str {
            &self.version
        }
    }

    fn sample_config(version: &str) -> RolloutConfig {
        RolloutConfig {
            release_reference: format!("quay.io/release:{version}"),
            release_version: version.to_string(),
            pull_secret_name: "pull-secret".to_string(),
            trust_bundle_name: None,
            global_config_string: "{}".to_string(),
            mco_raw_config: "manifest-a\n---\nmanifest-b".to_string(),
            haproxy_raw_config: None,
        }
    }

    #[test]
    fn hash_is_deterministic() {
        let a = sample_config("4.18.0");
        let b = sample_config("4.18.0");
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash_without_version(), b.hash_without_version());
    }

    #[test]
    fn hash_without_version_ignores_version() {
        let a = sample_config("4.18.0");
        let b = sample_config("4.18.1");
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash_without_version(), b.hash_without_version());
    }

    #[test]
    fn sort_stability_is_order_independent() {
        let manifests_forward = vec!["b-manifest".to_string(), "a-manifest".to_string()];
        let mut sorted = manifests_forward.clone();
        sorted.sort();
        let mut reversed = manifests_forward;
        reversed.reverse();
        reversed.sort();
        assert_eq!(sorted, reversed);
        assert_eq!(sorted.join("\n---\n"), "a-manifest\n---\nb-manifest");
    }

    #[test]
    fn gzip_round_trips() {
        let raw = "apiVersion: v1\nkind: MachineConfig\n";
        let compressed = compress(raw).unwrap();
        assert_eq!(decompress(&compressed).unwrap(), raw);
    }

    #[test]
    fn gzip_and_base64_round_trips() {
        let raw = "apiVersion: v1\nkind: MachineConfig\n";
        let encoded = compress_and_encode(raw).unwrap();
        assert_eq!(decode_and_decompress(&encoded).unwrap(), raw);
    }

    #[test]
    fn global_config_string_keeps_empty_substructs() {
        use crate::crd::hosted_cluster::{ClusterConfiguration, HostedClusterSpec, LocalObjectReference};

        let hc = HostedCluster::new(
            "hc",
            HostedClusterSpec {
                pull_secret: LocalObjectReference {
                    name: "pull".into(),
                },
                additional_trust_bundle: None,
                configuration: Some(ClusterConfiguration::default()),
                platform: None,
            },
        );
        let s = global_config_string(&hc);
        let parsed: StdMap<String, serde_json::Value> = serde_json::from_str(&s).unwrap();
        assert!(parsed.contains_key("proxy"));
        assert!(parsed.contains_key("image"));
    }
}
