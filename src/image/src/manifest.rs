//! Image manifest assembly.
//!
//! Composes ordered layers into a schema 2 manifest and an image config.
//! The layer order chosen here defines both the manifest `layers` array and
//! the config `rootfs.diff_ids` array; position `i` in each names the same
//! filesystem layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_core::config::BuildConfig;
use strata_core::error::Result;
use strata_core::media_type;

use crate::digest::Digest;
use crate::layer::LayerProduct;

/// Reference to a blob: `{mediaType, size, digest}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
}

/// `rootfs` section of an image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<Digest>,
}

/// Image config blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "Labels", default)]
    pub labels: BTreeMap<String, String>,
    pub rootfs: RootFs,
}

/// Manifest before the config descriptor is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub layers: Vec<Descriptor>,
}

impl PartialManifest {
    /// Attach the config descriptor, completing the manifest.
    pub fn with_config(self, config: Descriptor) -> ImageManifest {
        ImageManifest {
            schema_version: self.schema_version,
            media_type: self.media_type,
            config,
            layers: self.layers,
        }
    }
}

/// Schema 2 image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default = "default_manifest_media_type")]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

fn default_manifest_media_type() -> String {
    media_type::MANIFEST_V2.to_string()
}

/// Concatenate base layers, own layers and extra layers, in that order.
pub fn compose_layers(
    base_layers: &[LayerProduct],
    own_layers: &[LayerProduct],
    extra_layers: &[LayerProduct],
) -> Vec<LayerProduct> {
    base_layers
        .iter()
        .chain(own_layers)
        .chain(extra_layers)
        .cloned()
        .collect()
}

/// Build the image config for an ordered layer list.
///
/// Label values that are not JSON strings are stored as their JSON text.
pub fn build_config(
    layers: &[LayerProduct],
    labels: &BTreeMap<String, Value>,
    platform: &BuildConfig,
) -> Result<ImageConfig> {
    let diff_ids = layers
        .iter()
        .map(|layer| layer.diff_id_digest().cloned())
        .collect::<Result<Vec<_>>>()?;

    let labels = labels
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect();

    Ok(ImageConfig {
        architecture: platform.architecture.clone(),
        os: platform.os.clone(),
        labels,
        rootfs: RootFs {
            fs_type: "layers".to_string(),
            diff_ids,
        },
    })
}

/// Manifest `layers` for an ordered layer list, config still missing.
pub fn partial_manifest(layers: &[LayerProduct]) -> Result<PartialManifest> {
    let layers = layers
        .iter()
        .map(LayerProduct::descriptor)
        .collect::<Result<Vec<_>>>()?;
    Ok(PartialManifest {
        schema_version: 2,
        media_type: media_type::MANIFEST_V2.to_string(),
        layers,
    })
}

/// Canonical JSON bytes: object keys sorted at every depth, no whitespace.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = sort_keys(serde_json::to_value(value)?);
    Ok(serde_json::to_vec(&value)?)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
