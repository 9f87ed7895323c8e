//! Publish orchestration.
//!
//! Pushes an image product to a repository: every layer blob, then the
//! config blob, then the manifest. Each step checks existence first, and
//! layers that are known to live in another repository are mounted from
//! there instead of being uploaded again.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt, TryStreamExt};
use strata_core::error::Result;
use strata_core::media_type;

use crate::digest::Digest;
use crate::image::DockerImageProduct;
use crate::products::LayerIndex;
use crate::registry::RegistryClient;

/// How a blob ended up present in the target repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobPresence {
    /// Already there; nothing was sent.
    Existing,
    /// Mounted from its canonical repository.
    Mounted,
    /// Uploaded directly.
    Uploaded,
}

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedImage {
    pub repo: String,
    pub manifest_digest: Digest,
    /// `<host>/<repo>@<manifest digest>`
    pub uri: String,
}

impl fmt::Display for PublishedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

impl RegistryClient {
    /// Make a layer blob present in `repo`.
    ///
    /// With a `mount_source` the blob is first made present there (uploaded
    /// if needed) and then mounted into `repo`; without one it is uploaded
    /// straight to `repo`.
    pub async fn ensure_layer_present(
        &self,
        repo: &str,
        digest: &Digest,
        tar_path: &Path,
        mount_source: Option<&str>,
    ) -> Result<BlobPresence> {
        if self.blob_exists(repo, digest).await? {
            tracing::debug!(repo, digest = %digest, "Layer already present");
            return Ok(BlobPresence::Existing);
        }

        match mount_source {
            Some(source) if source != repo => {
                if !self.blob_exists(source, digest).await? {
                    self.upload_blob(source, digest, tar_path, media_type::OCTET_STREAM)
                        .await?;
                }
                self.mount_blob(repo, digest, source).await?;
                Ok(BlobPresence::Mounted)
            }
            _ => {
                self.upload_blob(repo, digest, tar_path, media_type::OCTET_STREAM)
                    .await?;
                Ok(BlobPresence::Uploaded)
            }
        }
    }

    /// Make the config blob present in `repo`. Configs are never mounted.
    pub async fn ensure_config_present(
        &self,
        repo: &str,
        digest: &Digest,
        config_path: &Path,
    ) -> Result<BlobPresence> {
        if self.blob_exists(repo, digest).await? {
            return Ok(BlobPresence::Existing);
        }
        self.upload_blob(repo, digest, config_path, media_type::IMAGE_CONFIG)
            .await?;
        Ok(BlobPresence::Uploaded)
    }

    /// Put the manifest under its digest unless the registry already has it.
    pub async fn ensure_image_manifest_present(
        &self,
        repo: &str,
        digest: &Digest,
        manifest_path: &Path,
    ) -> Result<BlobPresence> {
        let reference = digest.to_string();
        if self.manifest_exists(repo, &reference).await? {
            return Ok(BlobPresence::Existing);
        }
        self.put_manifest(repo, &reference, manifest_path).await?;
        Ok(BlobPresence::Uploaded)
    }

    /// Mount every layer of `source_repo:source_ref` missing from `dest_repo`.
    ///
    /// Returns the number of layers mounted.
    pub async fn ensure_base_layers_mounted(
        &self,
        source_repo: &str,
        source_ref: &str,
        dest_repo: &str,
    ) -> Result<usize> {
        let layers = self.get_image_layers(source_repo, source_ref).await?;
        let mut mounted = 0;
        for (descriptor, _) in &layers {
            if !self.blob_exists(dest_repo, &descriptor.digest).await? {
                self.mount_blob(dest_repo, &descriptor.digest, source_repo)
                    .await?;
                mounted += 1;
            }
        }
        tracing::info!(
            source_repo,
            source_ref,
            dest_repo,
            layers = layers.len(),
            mounted,
            "Base layers mounted"
        );
        Ok(mounted)
    }
}

struct PendingLayer {
    digest: Digest,
    tar_path: PathBuf,
    mount_source: Option<String>,
}

/// Publish `image` to `repo`.
///
/// Layers are pushed with at most `concurrency` in flight. The config is
/// pushed only after every layer is confirmed present, and the manifest
/// only after the config.
pub async fn publish_image(
    client: &RegistryClient,
    repo: &str,
    image: &DockerImageProduct,
    layers: &LayerIndex,
    concurrency: usize,
) -> Result<PublishedImage> {
    // Resolve everything locally before touching the network
    let manifest_layers = image.layers_in(layers)?;
    let layer_count = manifest_layers.len();

    // A blob listed at several manifest positions is pushed once
    let mut seen = HashSet::new();
    let mut pending = Vec::with_capacity(layer_count);
    for layer in &manifest_layers {
        let digest = layer.digest()?;
        if !seen.insert(digest.clone()) {
            continue;
        }
        pending.push(PendingLayer {
            digest: digest.clone(),
            tar_path: layer.tar_path(),
            mount_source: layer.canonical_image_repo()?.map(str::to_string),
        });
    }

    let outcomes: Vec<BlobPresence> = stream::iter(pending.iter())
        .map(|layer| {
            client.ensure_layer_present(
                repo,
                &layer.digest,
                &layer.tar_path,
                layer.mount_source.as_deref(),
            )
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;

    let count = |presence: BlobPresence| outcomes.iter().filter(|o| **o == presence).count();
    tracing::info!(
        repo,
        layers = layer_count,
        distinct = pending.len(),
        existing = count(BlobPresence::Existing),
        mounted = count(BlobPresence::Mounted),
        uploaded = count(BlobPresence::Uploaded),
        "Layers present"
    );

    client
        .ensure_config_present(repo, image.config_digest()?, &image.config_path())
        .await?;
    let manifest_digest = image.manifest_digest()?.clone();
    client
        .ensure_image_manifest_present(repo, &manifest_digest, &image.manifest_path())
        .await?;

    let published = PublishedImage {
        repo: repo.to_string(),
        uri: format!("{}/{}@{}", client.public_host(), repo, manifest_digest),
        manifest_digest,
    };
    tracing::info!(repo, uri = %published.uri, "Published image");
    Ok(published)
}
