//! Layer products.
//!
//! A layer product is a directory holding `layer.tar` and a `metadata.json`
//! sidecar. It is written once, never mutated, and can be reopened by any
//! later process from the directory path alone.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use strata_core::error::{Result, StrataError};
use strata_core::media_type;

use crate::archive;
use crate::digest::{self, Digest};
use crate::manifest::Descriptor;

/// Archive file inside a layer directory.
pub const LAYER_TAR_FILE_NAME: &str = "layer.tar";

/// Metadata sidecar inside a layer directory.
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Persisted layer metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMetadata {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
    pub diff_id_digest: Digest,
    pub canonical_image_repo: Option<String>,
}

/// Optional inputs to [`LayerProduct::write`].
#[derive(Debug, Clone, Default)]
pub struct LayerOptions {
    /// Defaults to the blob digest (layers are stored uncompressed).
    pub diff_id_digest: Option<Digest>,
    /// Defaults to [`media_type::LAYER_TAR`].
    pub media_type: Option<String>,
    /// Repository the blob is already known to exist in.
    pub canonical_image_repo: Option<String>,
}

/// Handle to one layer directory.
///
/// Metadata is read on first access and cached for the lifetime of the
/// handle. Open a new handle to observe a rewritten directory.
#[derive(Debug, Clone)]
pub struct LayerProduct {
    dir: PathBuf,
    metadata: OnceLock<LayerMetadata>,
}

impl LayerProduct {
    /// Write a layer product into `results_dir`.
    ///
    /// The archive at `tar_path` is moved to `results_dir/layer.tar` if it is
    /// not already there, digested, and described by a fresh metadata record.
    pub fn write(results_dir: &Path, tar_path: &Path, options: LayerOptions) -> Result<Self> {
        std::fs::create_dir_all(results_dir)?;
        let dest = results_dir.join(LAYER_TAR_FILE_NAME);
        if tar_path != dest {
            move_file(tar_path, &dest)?;
        }

        let digest = digest::digest_file(&dest)?;
        let size = std::fs::metadata(&dest)?.len();
        let metadata = LayerMetadata {
            media_type: options
                .media_type
                .unwrap_or_else(|| media_type::LAYER_TAR.to_string()),
            size,
            diff_id_digest: options.diff_id_digest.unwrap_or_else(|| digest.clone()),
            digest,
            canonical_image_repo: options.canonical_image_repo,
        };

        let json = serde_json::to_vec(&metadata)?;
        std::fs::write(results_dir.join(METADATA_FILE_NAME), json)?;

        tracing::debug!(
            dir = %results_dir.display(),
            digest = %metadata.digest,
            size = metadata.size,
            "Wrote layer product"
        );

        let product = Self::open(results_dir);
        let _ = product.metadata.set(metadata);
        Ok(product)
    }

    /// Reopen a previously written layer directory. Nothing is read until
    /// the metadata is first needed.
    pub fn open(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            metadata: OnceLock::new(),
        }
    }

    /// Cached metadata record.
    pub fn metadata(&self) -> Result<&LayerMetadata> {
        if let Some(metadata) = self.metadata.get() {
            return Ok(metadata);
        }
        let path = self.dir.join(METADATA_FILE_NAME);
        let data = std::fs::read(&path).map_err(|e| {
            StrataError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to read layer metadata {}: {}", path.display(), e),
            ))
        })?;
        let metadata: LayerMetadata = serde_json::from_slice(&data)?;
        Ok(self.metadata.get_or_init(|| metadata))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tar_path(&self) -> PathBuf {
        self.dir.join(LAYER_TAR_FILE_NAME)
    }

    pub fn digest(&self) -> Result<&Digest> {
        Ok(&self.metadata()?.digest)
    }

    pub fn diff_id_digest(&self) -> Result<&Digest> {
        Ok(&self.metadata()?.diff_id_digest)
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.metadata()?.size)
    }

    pub fn media_type(&self) -> Result<&str> {
        Ok(&self.metadata()?.media_type)
    }

    pub fn canonical_image_repo(&self) -> Result<Option<&str>> {
        Ok(self.metadata()?.canonical_image_repo.as_deref())
    }

    /// `{mediaType, size, digest}` for the manifest `layers` array.
    pub fn descriptor(&self) -> Result<Descriptor> {
        let metadata = self.metadata()?;
        Ok(Descriptor {
            media_type: metadata.media_type.clone(),
            size: metadata.size,
            digest: metadata.digest.clone(),
        })
    }

    /// Check the archive against the persisted size, then the persisted digest.
    pub fn validate_tar(&self) -> Result<()> {
        let metadata = self.metadata()?;
        let tar_path = self.tar_path();
        let actual = std::fs::metadata(&tar_path)?.len();
        if actual != metadata.size {
            return Err(StrataError::SizeMismatch {
                path: tar_path.display().to_string(),
                expected: metadata.size,
                actual,
            });
        }
        digest::verify_file(&tar_path, &metadata.digest)
    }
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Cross-device: copy then remove
    std::fs::copy(from, to).map_err(|e| {
        StrataError::IoError(std::io::Error::new(
            e.kind(),
            format!(
                "Failed to move {} to {}: {}",
                from.display(),
                to.display(),
                e
            ),
        ))
    })?;
    std::fs::remove_file(from)?;
    Ok(())
}

/// Builds layer products from local content.
pub struct LayerBuilder;

impl LayerBuilder {
    /// Archive a materialized directory (an application bundle) rooted at
    /// `tar_root`, plus a symlink map such as
    /// `/data/app/<bundle>/libs/x.jar -> /data/deps/x.jar`.
    pub fn from_directory(
        results_dir: &Path,
        source_dir: &Path,
        tar_root: &str,
        symlinks: &BTreeMap<String, String>,
        canonical_repo: Option<String>,
    ) -> Result<LayerProduct> {
        let files = archive::map_source_dir(source_dir, tar_root)?;
        Self::build(results_dir, &files, symlinks, canonical_repo)
    }

    /// Archive a flat list of files, each placed at `base_dir/<file name>`
    /// (a shared dependency layer, for example).
    pub fn from_files(
        results_dir: &Path,
        files: &[PathBuf],
        base_dir: &str,
        canonical_repo: Option<String>,
    ) -> Result<LayerProduct> {
        let mut mapping = BTreeMap::new();
        for file in files {
            let real = std::fs::canonicalize(file).map_err(|e| StrataError::SourceUnavailable {
                path: file.display().to_string(),
                message: e.to_string(),
            })?;
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    StrataError::ArchiveError(format!("Invalid file name: {}", file.display()))
                })?;
            let destination = format!("{}/{}", base_dir.trim_end_matches('/'), name);
            if mapping.insert(destination.clone(), real).is_some() {
                return Err(StrataError::ArchiveError(format!(
                    "Two files map to {}",
                    destination
                )));
            }
        }
        Self::build(results_dir, &mapping, &BTreeMap::new(), canonical_repo)
    }

    fn build(
        results_dir: &Path,
        files: &BTreeMap<String, PathBuf>,
        symlinks: &BTreeMap<String, String>,
        canonical_repo: Option<String>,
    ) -> Result<LayerProduct> {
        std::fs::create_dir_all(results_dir)?;
        // Staged beside the results so the final move is a rename; removed on drop.
        let staging = tempfile::TempDir::new_in(results_dir)?;
        let staged_tar = staging.path().join(LAYER_TAR_FILE_NAME);
        archive::create_stable_tar(&staged_tar, files, symlinks)?;

        let product = LayerProduct::write(
            results_dir,
            &staged_tar,
            LayerOptions {
                canonical_image_repo: canonical_repo,
                ..Default::default()
            },
        )?;
        tracing::info!(
            dir = %results_dir.display(),
            digest = %product.digest()?,
            files = files.len(),
            symlinks = symlinks.len(),
            "Built layer"
        );
        Ok(product)
    }
}
