//! The fixed union of OS-configuration manifest kinds the Config Generator accepts
//! (spec §4.1), and the per-kind normalization rules applied during decode.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};

/// MCO's built-in pool selector, forced onto `KubeletConfig`/`ContainerRuntimeConfig`
/// manifests regardless of what the author wrote (spec §4.1).
const MCO_POOL_SELECTOR_KEY: &str = "machineconfiguration.openshift.io/role";
const MCO_POOL_SELECTOR_VALUE: &str = "worker";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("manifest {index} has no apiVersion/kind"))]
    MissingTypeMeta { index: usize },
    #[snafu(display("manifest {index} ({api_version}/{kind}) is not a recognized OS-config kind"))]
    UnrecognizedKind {
        index: usize,
        api_version: String,
        kind: String,
    },
    #[snafu(display("manifest {index} failed to parse as YAML: {source}"))]
    InvalidYaml {
        index: usize,
        source: serde_yaml::Error,
    },
    #[snafu(display("manifest {index} failed to re-serialize: {source}"))]
    Reserialize {
        index: usize,
        source: serde_json::Error,
    },
}

/// Minimal type-meta + freeform-fields view shared by every recognized manifest kind.
/// The generator never needs more than "what kind is this" plus "normalize a couple of
/// known fields then keep the rest as-is", so manifests are carried as [`Value`] rather
/// than fully-typed structs — the canonical schema for each kind lives upstream (spec §1
/// Non-goals), this is a pass-through editor.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Manifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: ManifestKind,
    #[serde(flatten)]
    pub rest: Value,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum ManifestKind {
    MachineConfig,
    KubeletConfig,
    ContainerRuntimeConfig,
    ImageContentSourcePolicy,
    ImageDigestMirrorSet,
    ClusterImagePolicy,
}

/// Splits a `---`-joined YAML blob into individual manifests, decodes each against the
/// fixed kind union, and applies the per-kind normalization rules (spec §4.1). Returns
/// the manifests in their original order; the caller is responsible for sorting the
/// canonical-serialized form (the generator does this over all gathered documents at
/// once, not per-document).
pub fn decode_and_normalize(raw: &str, offset: usize) -> Result<Vec<Manifest>, Error> {
    let mut manifests = Vec::new();
    for (i, doc) in raw.split("\n---\n").enumerate() {
        let doc = doc.trim();
        if doc.is_empty() {
            continue;
        }
        let index = offset + i;
        let value: Value = serde_yaml::from_str(doc).context(InvalidYamlSnafu { index })?;
        let api_version = value
            .get("apiVersion")
            .and_then(Value::as_str)
            .context(MissingTypeMetaSnafu { index })?
            .to_string();
        let kind_str = value
            .get("kind")
            .and_then(Value::as_str)
            .context(MissingTypeMetaSnafu { index })?
            .to_string();
        let kind = parse_kind(&kind_str).context(UnrecognizedKindSnafu {
            index,
            api_version: api_version.clone(),
            kind: kind_str.clone(),
        })?;

        let mut manifest: Manifest =
            serde_json::from_value(value).context(ReserializeSnafu { index })?;
        normalize(&mut manifest, kind);
        manifests.push(manifest);
    }
    Ok(manifests)
}

fn parse_kind(raw: &str) -> Option<ManifestKind> {
    Some(match raw {
        "MachineConfig" => ManifestKind::MachineConfig,
        "KubeletConfig" => ManifestKind::KubeletConfig,
        "ContainerRuntimeConfig" => ManifestKind::ContainerRuntimeConfig,
        "ImageContentSourcePolicy" => ManifestKind::ImageContentSourcePolicy,
        "ImageDigestMirrorSet" => ManifestKind::ImageDigestMirrorSet,
        "ClusterImagePolicy" => ManifestKind::ClusterImagePolicy,
        _ => return None,
    })
}

fn normalize(manifest: &mut Manifest, kind: ManifestKind) {
    match kind {
        ManifestKind::MachineConfig => {
            set_label(manifest, "machineconfiguration.openshift.io/role", "worker");
        }
        ManifestKind::KubeletConfig | ManifestKind::ContainerRuntimeConfig => {
            set_match_label(manifest, MCO_POOL_SELECTOR_KEY, MCO_POOL_SELECTOR_VALUE);
        }
        ManifestKind::ImageContentSourcePolicy
        | ManifestKind::ImageDigestMirrorSet
        | ManifestKind::ClusterImagePolicy => {}
    }
}

fn set_label(manifest: &mut Manifest, key: &str, value: &str) {
    let metadata = manifest
        .rest
        .as_object_mut()
        .and_then(|obj| obj.entry("metadata").or_insert_with(|| Value::Object(Default::default())).as_object_mut());
    if let Some(metadata) = metadata {
        let labels = metadata
            .entry("labels")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(labels) = labels.as_object_mut() {
            labels.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
}

fn set_match_label(manifest: &mut Manifest, key: &str, value: &str) {
    let spec = manifest
        .rest
        .as_object_mut()
        .and_then(|obj| obj.entry("spec").or_insert_with(|| Value::Object(Default::default())).as_object_mut());
    if let Some(spec) = spec {
        let selector = spec
            .entry("machineConfigPoolSelector")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(selector) = selector.as_object_mut() {
            let match_labels = selector
                .entry("matchLabels")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(match_labels) = match_labels.as_object_mut() {
                match_labels.insert(key.to_string(), Value::String(value.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_kind_is_fatal() {
        let raw = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n";
        let err = decode_and_normalize(raw, 0).unwrap_err();
        assert!(matches!(err, Error::UnrecognizedKind { .. }));
    }

    #[test]
    fn machine_config_role_label_is_forced() {
        let raw = "apiVersion: machineconfiguration.openshift.io/v1\nkind: MachineConfig\nmetadata:\n  name: 99-custom\n  labels:\n    machineconfiguration.openshift.io/role: master\nspec:\n  config: {}\n";
        let manifests = decode_and_normalize(raw, 0).unwrap();
        assert_eq!(manifests.len(), 1);
        let labels = manifests[0]
            .rest
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .unwrap();
        assert_eq!(
            labels.get("machineconfiguration.openshift.io/role"),
            Some(&Value::String("worker".to_string()))
        );
    }

    #[test]
    fn kubelet_config_pool_selector_is_forced() {
        let raw = "apiVersion: machineconfiguration.openshift.io/v1\nkind: KubeletConfig\nmetadata:\n  name: custom\nspec:\n  kubeletConfig: {}\n";
        let manifests = decode_and_normalize(raw, 0).unwrap();
        let selector = manifests[0]
            .rest
            .get("spec")
            .and_then(|s| s.get("machineConfigPoolSelector"))
            .and_then(|s| s.get("matchLabels"))
            .unwrap();
        assert_eq!(
            selector.get(MCO_POOL_SELECTOR_KEY),
            Some(&Value::String(MCO_POOL_SELECTOR_VALUE.to_string()))
        );
    }

    #[test]
    fn multiple_documents_in_one_blob_all_decode() {
        let raw = "apiVersion: machineconfiguration.openshift.io/v1\nkind: MachineConfig\nmetadata:\n  name: a\nspec: {}\n\n---\napiVersion: machineconfiguration.openshift.io/v1\nkind: MachineConfig\nmetadata:\n  name: b\nspec: {}\n";
        let manifests = decode_and_normalize(raw, 0).unwrap();
        assert_eq!(manifests.len(), 2);
    }
}
