//! Image products.
//!
//! An image product directory holds the canonical `config.json` and
//! `manifest.json` blobs plus a `metadata.json` record of their digests, so
//! distribution can look digests up without re-reading the blobs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_core::config::BuildConfig;
use strata_core::error::{Result, StrataError};
use strata_core::media_type;

use crate::digest::{self, Digest};
use crate::layer::LayerProduct;
use crate::manifest::{self, Descriptor, ImageConfig, ImageManifest, PartialManifest};
use crate::products::LayerIndex;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Persisted image metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub manifest_digest: Digest,
    pub config_digest: Digest,
    /// Extra layer directories, relative to the image directory when nested in it.
    pub extra_layers: Vec<String>,
}

/// Handle to one image product directory.
#[derive(Debug, Clone)]
pub struct DockerImageProduct {
    dir: PathBuf,
    metadata: OnceLock<ImageMetadata>,
    manifest: OnceLock<ImageManifest>,
}

impl DockerImageProduct {
    /// Serialize `config`, then the manifest that references it.
    ///
    /// The config digest covers only the config bytes; the manifest digest
    /// covers the config descriptor and the layer descriptors. Identical
    /// inputs always produce identical bytes and digests.
    pub fn write_image_manifest(
        cache_dir: &Path,
        config: &ImageConfig,
        partial: PartialManifest,
        extra_layers: &[LayerProduct],
    ) -> Result<Self> {
        std::fs::create_dir_all(cache_dir)?;

        let config_bytes = manifest::canonical_json(config)?;
        std::fs::write(cache_dir.join(CONFIG_FILE_NAME), &config_bytes)?;
        let config_digest = Digest::of_bytes(&config_bytes);

        let image_manifest = partial.with_config(Descriptor {
            media_type: media_type::IMAGE_CONFIG.to_string(),
            size: config_bytes.len() as u64,
            digest: config_digest.clone(),
        });
        let manifest_bytes = manifest::canonical_json(&image_manifest)?;
        std::fs::write(cache_dir.join(MANIFEST_FILE_NAME), &manifest_bytes)?;
        let manifest_digest = Digest::of_bytes(&manifest_bytes);

        let extra_layers = extra_layers
            .iter()
            .map(|layer| relative_dir(cache_dir, layer.dir()))
            .collect::<Result<Vec<_>>>()?;
        let metadata = ImageMetadata {
            manifest_digest,
            config_digest,
            extra_layers,
        };
        std::fs::write(
            cache_dir.join(METADATA_FILE_NAME),
            serde_json::to_vec(&metadata)?,
        )?;

        tracing::info!(
            dir = %cache_dir.display(),
            manifest_digest = %metadata.manifest_digest,
            config_digest = %metadata.config_digest,
            layers = image_manifest.layers.len(),
            "Wrote image manifest"
        );

        let product = Self::open(cache_dir);
        let _ = product.metadata.set(metadata);
        let _ = product.manifest.set(image_manifest);
        Ok(product)
    }

    /// Compose base, own and extra layers and write the resulting image.
    pub fn assemble(
        cache_dir: &Path,
        base_layers: &[LayerProduct],
        own_layers: &[LayerProduct],
        extra_layers: &[LayerProduct],
        labels: &BTreeMap<String, Value>,
        platform: &BuildConfig,
    ) -> Result<Self> {
        let layers = manifest::compose_layers(base_layers, own_layers, extra_layers);
        let config = manifest::build_config(&layers, labels, platform)?;
        let partial = manifest::partial_manifest(&layers)?;
        Self::write_image_manifest(cache_dir, &config, partial, extra_layers)
    }

    pub fn open(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            metadata: OnceLock::new(),
            manifest: OnceLock::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cached metadata record.
    pub fn metadata(&self) -> Result<&ImageMetadata> {
        if let Some(metadata) = self.metadata.get() {
            return Ok(metadata);
        }
        let metadata: ImageMetadata = read_json(&self.dir.join(METADATA_FILE_NAME))?;
        Ok(self.metadata.get_or_init(|| metadata))
    }

    /// Cached parsed manifest.
    pub fn manifest(&self) -> Result<&ImageManifest> {
        if let Some(manifest) = self.manifest.get() {
            return Ok(manifest);
        }
        let manifest: ImageManifest = read_json(&self.manifest_path())?;
        Ok(self.manifest.get_or_init(|| manifest))
    }

    pub fn manifest_digest(&self) -> Result<&Digest> {
        Ok(&self.metadata()?.manifest_digest)
    }

    pub fn config_digest(&self) -> Result<&Digest> {
        Ok(&self.metadata()?.config_digest)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE_NAME)
    }

    pub fn layer_descriptors(&self) -> Result<&[Descriptor]> {
        Ok(&self.manifest()?.layers)
    }

    pub fn extra_layers(&self) -> Result<Vec<LayerProduct>> {
        Ok(self
            .metadata()?
            .extra_layers
            .iter()
            .map(|path| LayerProduct::open(&self.dir.join(path)))
            .collect())
    }

    /// Layer products for every manifest layer, in manifest order.
    ///
    /// Digests are looked up in `index` first, then among the image's own
    /// extra layers. Any digest found in neither is `MissingLayer`.
    pub fn layers_in(&self, index: &LayerIndex) -> Result<Vec<LayerProduct>> {
        let extra = self.extra_layers()?;
        self.layer_descriptors()?
            .iter()
            .map(|descriptor| {
                if let Some(layer) = index.get(&descriptor.digest) {
                    return Ok(layer.clone());
                }
                for layer in &extra {
                    if layer.digest()? == &descriptor.digest {
                        return Ok(layer.clone());
                    }
                }
                Err(StrataError::MissingLayer(descriptor.digest.to_string()))
            })
            .collect()
    }

    /// Re-hash both blobs and compare with the recorded digests.
    pub fn verify(&self) -> Result<()> {
        let metadata = self.metadata()?;
        digest::verify_file(&self.config_path(), &metadata.config_digest)?;
        digest::verify_file(&self.manifest_path(), &metadata.manifest_digest)
    }
}

fn relative_dir(base: &Path, dir: &Path) -> Result<String> {
    let path = dir.strip_prefix(base).unwrap_or(dir);
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| StrataError::Other(format!("Path is not valid UTF-8: {}", dir.display())))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read(path).map_err(|e| {
        StrataError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to read {}: {}", path.display(), e),
        ))
    })?;
    Ok(serde_json::from_slice(&data)?)
}
