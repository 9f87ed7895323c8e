//! Remote image resolution.
//!
//! Materializes the layers of `repo:reference` as local layer products so
//! they can be composed into new images and mounted back from `repo` on
//! push.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use strata_core::error::{Result, StrataError};

use crate::digest::Digest;
use crate::layer::{LayerOptions, LayerProduct};
use crate::manifest::{Descriptor, ImageConfig};
use crate::registry::RegistryClient;

/// Ordered list of layer directories, relative to the resolution dir.
pub const LAYER_LIST_FILE_NAME: &str = "layer_list.json";

impl RegistryClient {
    /// Manifest layer descriptors zipped with the config's `diff_ids`.
    pub async fn get_image_layers(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<Vec<(Descriptor, Digest)>> {
        let manifest = self.get_manifest(repo, reference).await?;
        let config_bytes = self.get_blob(repo, &manifest.config.digest).await?;
        let config: ImageConfig = serde_json::from_slice(&config_bytes)?;

        let diff_ids = config.rootfs.diff_ids;
        if manifest.layers.len() != diff_ids.len() {
            return Err(StrataError::LayerCountMismatch {
                layers: manifest.layers.len(),
                diff_ids: diff_ids.len(),
            });
        }
        Ok(manifest.layers.into_iter().zip(diff_ids).collect())
    }
}

/// Downloads remote images into layer products.
pub struct RemoteImageResolver<'a> {
    client: &'a RegistryClient,
}

impl<'a> RemoteImageResolver<'a> {
    pub fn new(client: &'a RegistryClient) -> Self {
        Self { client }
    }

    /// Resolve `repo:reference` into `cache_dir`.
    ///
    /// Layers are downloaded one at a time in manifest order, each into
    /// `cache_dir/<digest>`. A layer directory that already holds a valid
    /// copy of the blob is reused. The layer list is written last, so an
    /// interrupted resolution never looks complete.
    pub async fn resolve(
        &self,
        repo: &str,
        reference: &str,
        cache_dir: &Path,
    ) -> Result<ResolvedBaseImage> {
        let layers = self.client.get_image_layers(repo, reference).await?;
        tokio::fs::create_dir_all(cache_dir).await?;

        let mut products = Vec::with_capacity(layers.len());
        let mut names = Vec::with_capacity(layers.len());
        for (descriptor, diff_id) in layers {
            let name = descriptor.digest.to_string();
            let layer_dir = cache_dir.join(&name);
            let product = match reuse_layer(&layer_dir, &descriptor, repo) {
                Some(product) => product,
                None => self.fetch_layer(repo, &descriptor, diff_id, &layer_dir).await?,
            };
            products.push(product);
            names.push(name);
        }

        let json = serde_json::to_vec(&names)?;
        tokio::fs::write(cache_dir.join(LAYER_LIST_FILE_NAME), json).await?;

        tracing::info!(
            repo,
            reference,
            layers = products.len(),
            dir = %cache_dir.display(),
            "Resolved remote image"
        );

        let resolved = ResolvedBaseImage::open(cache_dir);
        let _ = resolved.layers.set(products);
        Ok(resolved)
    }

    async fn fetch_layer(
        &self,
        repo: &str,
        descriptor: &Descriptor,
        diff_id: Digest,
        layer_dir: &Path,
    ) -> Result<LayerProduct> {
        let staging = tempfile::TempDir::new_in(layer_dir.parent().unwrap_or(layer_dir))
            .map_err(|e| {
                StrataError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create staging dir: {}", e),
                ))
            })?;
        let staged = staging.path().join("blob");
        let content_type = self
            .client
            .download_blob(repo, &descriptor.digest, &staged)
            .await?;

        LayerProduct::write(
            layer_dir,
            &staged,
            LayerOptions {
                diff_id_digest: Some(diff_id),
                media_type: Some(content_type),
                canonical_image_repo: Some(repo.to_string()),
            },
        )
    }
}

/// A previously resolved layer, if its directory is intact.
fn reuse_layer(dir: &Path, descriptor: &Descriptor, repo: &str) -> Option<LayerProduct> {
    let product = LayerProduct::open(dir);
    let metadata = product.metadata().ok()?;
    if metadata.digest != descriptor.digest
        || metadata.canonical_image_repo.as_deref() != Some(repo)
    {
        return None;
    }
    product.validate_tar().ok()?;
    tracing::debug!(dir = %dir.display(), digest = %descriptor.digest, "Reusing resolved layer");
    Some(product)
}

/// Layers of a resolved remote image, in manifest order.
#[derive(Debug)]
pub struct ResolvedBaseImage {
    dir: PathBuf,
    layers: OnceLock<Vec<LayerProduct>>,
}

impl ResolvedBaseImage {
    /// Reopen a resolution directory without touching the network.
    pub fn open(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            layers: OnceLock::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layers(&self) -> Result<&[LayerProduct]> {
        if let Some(layers) = self.layers.get() {
            return Ok(layers);
        }
        let path = self.dir.join(LAYER_LIST_FILE_NAME);
        let data = std::fs::read(&path).map_err(|e| {
            StrataError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to read layer list {}: {}", path.display(), e),
            ))
        })?;
        let names: Vec<String> = serde_json::from_slice(&data)?;
        let layers = names
            .iter()
            .map(|name| LayerProduct::open(&self.dir.join(name)))
            .collect();
        Ok(self.layers.get_or_init(|| layers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryAuth;
    use strata_core::config::RegistryConfig;
    use strata_core::media_type;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REPO: &str = "base/os";

    fn client_for(server: &MockServer) -> RegistryClient {
        let config = RegistryConfig {
            url: server.uri(),
            ..Default::default()
        };
        RegistryClient::with_auth(&config, RegistryAuth::anonymous()).unwrap()
    }

    struct RemoteImage {
        blobs: Vec<Vec<u8>>,
        diff_ids: Vec<Digest>,
    }

    impl RemoteImage {
        fn new(blobs: &[&[u8]]) -> Self {
            let blobs: Vec<Vec<u8>> = blobs.iter().map(|b| b.to_vec()).collect();
            let diff_ids = blobs
                .iter()
                .map(|b| Digest::of_bytes(&[b.as_slice(), b"-uncompressed"].concat()))
                .collect();
            Self { blobs, diff_ids }
        }

        fn digests(&self) -> Vec<Digest> {
            self.blobs.iter().map(|b| Digest::of_bytes(b)).collect()
        }

        async fn serve(&self, server: &MockServer, reference: &str) {
            let config = serde_json::json!({
                "architecture": "amd64",
                "os": "linux",
                "rootfs": {
                    "type": "layers",
                    "diff_ids": self.diff_ids.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
                },
            });
            let config_bytes = serde_json::to_vec(&config).unwrap();
            let config_digest = Digest::of_bytes(&config_bytes);
            let layers: Vec<_> = self
                .blobs
                .iter()
                .map(|b| {
                    serde_json::json!({
                        "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                        "size": b.len(),
                        "digest": Digest::of_bytes(b).to_string(),
                    })
                })
                .collect();
            let manifest = serde_json::json!({
                "schemaVersion": 2,
                "mediaType": media_type::MANIFEST_V2,
                "config": {
                    "mediaType": media_type::IMAGE_CONFIG,
                    "size": config_bytes.len(),
                    "digest": config_digest.to_string(),
                },
                "layers": layers,
            });

            Mock::given(method("GET"))
                .and(path(format!("/v2/{}/manifests/{}", REPO, reference)))
                .respond_with(ResponseTemplate::new(200).set_body_json(manifest))
                .mount(server)
                .await;
            Mock::given(method("GET"))
                .and(path(format!("/v2/{}/blobs/{}", REPO, config_digest)))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(config_bytes))
                .mount(server)
                .await;
            for blob in &self.blobs {
                Mock::given(method("GET"))
                    .and(path(format!("/v2/{}/blobs/{}", REPO, Digest::of_bytes(blob))))
                    .respond_with(
                        ResponseTemplate::new(200)
                            .insert_header("Content-Type", "application/vnd.docker.image.rootfs.diff.tar.gzip")
                            .set_body_bytes(blob.clone()),
                    )
                    .mount(server)
                    .await;
            }
        }
    }

    #[tokio::test]
    async fn test_get_image_layers_zips_diff_ids() {
        let server = MockServer::start().await;
        let image = RemoteImage::new(&[b"first", b"second"]);
        image.serve(&server, "stable").await;

        let client = client_for(&server);
        let layers = client.get_image_layers(REPO, "stable").await.unwrap();

        assert_eq!(layers.len(), 2);
        for (i, (descriptor, diff_id)) in layers.iter().enumerate() {
            assert_eq!(descriptor.digest, image.digests()[i]);
            assert_eq!(diff_id, &image.diff_ids[i]);
        }
    }

    #[tokio::test]
    async fn test_get_image_layers_count_mismatch() {
        let server = MockServer::start().await;
        let mut image = RemoteImage::new(&[b"first", b"second"]);
        image.diff_ids.pop();
        image.serve(&server, "stable").await;

        let client = client_for(&server);
        let result = client.get_image_layers(REPO, "stable").await;
        assert!(matches!(
            result,
            Err(StrataError::LayerCountMismatch {
                layers: 2,
                diff_ids: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_resolve_materializes_layers_in_order() {
        let server = MockServer::start().await;
        let image = RemoteImage::new(&[b"first layer", b"second layer"]);
        image.serve(&server, "stable").await;
        let tmp = TempDir::new().unwrap();
        let cache_dir = tmp.path().join("resolved");

        let client = client_for(&server);
        let resolved = RemoteImageResolver::new(&client)
            .resolve(REPO, "stable", &cache_dir)
            .await
            .unwrap();

        let layers = resolved.layers().unwrap();
        assert_eq!(layers.len(), 2);
        for (i, layer) in layers.iter().enumerate() {
            assert_eq!(layer.digest().unwrap(), &image.digests()[i]);
            assert_eq!(layer.diff_id_digest().unwrap(), &image.diff_ids[i]);
            assert_eq!(layer.canonical_image_repo().unwrap(), Some(REPO));
            assert_eq!(
                layer.media_type().unwrap(),
                "application/vnd.docker.image.rootfs.diff.tar.gzip"
            );
            assert_eq!(layer.dir(), cache_dir.join(image.digests()[i].to_string()));
            layer.validate_tar().unwrap();
        }

        // No staging leftovers next to the layer dirs
        let entries = std::fs::read_dir(&cache_dir).unwrap().count();
        assert_eq!(entries, 3);
    }

    #[tokio::test]
    async fn test_resolve_reopens_without_network() {
        let server = MockServer::start().await;
        let image = RemoteImage::new(&[b"only layer"]);
        image.serve(&server, "v1").await;
        let tmp = TempDir::new().unwrap();

        let client = client_for(&server);
        RemoteImageResolver::new(&client)
            .resolve(REPO, "v1", tmp.path())
            .await
            .unwrap();
        drop(server);

        let reopened = ResolvedBaseImage::open(tmp.path());
        let layers = reopened.layers().unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].digest().unwrap(), &image.digests()[0]);
        assert_eq!(layers[0].canonical_image_repo().unwrap(), Some(REPO));
    }

    #[tokio::test]
    async fn test_resolve_reuses_intact_layers() {
        let server = MockServer::start().await;
        let image = RemoteImage::new(&[b"cached layer"]);
        image.serve(&server, "v1").await;
        let tmp = TempDir::new().unwrap();

        let client = client_for(&server);
        let resolver = RemoteImageResolver::new(&client);
        resolver.resolve(REPO, "v1", tmp.path()).await.unwrap();
        resolver.resolve(REPO, "v1", tmp.path()).await.unwrap();

        let blob_path = format!("/v2/{}/blobs/{}", REPO, image.digests()[0]);
        let downloads = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == blob_path)
            .count();
        assert_eq!(downloads, 1);
    }

    #[tokio::test]
    async fn test_resolve_rejects_corrupt_blob() {
        let server = MockServer::start().await;
        let image = RemoteImage::new(&[b"expected"]);
        image.serve(&server, "v1").await;
        // Outranks the blob mock registered by serve()
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/blobs/{}", REPO, image.digests()[0])))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .with_priority(1)
            .mount(&server)
            .await;
        let tmp = TempDir::new().unwrap();

        let client = client_for(&server);
        let result = RemoteImageResolver::new(&client)
            .resolve(REPO, "v1", tmp.path())
            .await;

        assert!(matches!(result, Err(StrataError::ContentMismatch { .. })));
        assert!(!tmp.path().join(LAYER_LIST_FILE_NAME).exists());
        assert!(!tmp.path().join(image.digests()[0].to_string()).exists());
    }
}
