//! Local daemon import.
//!
//! For environments that load images into a local daemon instead of
//! pushing them: packs an image product into the tar layout accepted by
//! `docker load` and runs the import.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use strata_core::error::{Result, StrataError};

use crate::image::DockerImageProduct;
use crate::layer::LAYER_TAR_FILE_NAME;
use crate::products::LayerIndex;

/// File name of the archive written by [`create_load_archive`].
pub const LOAD_ARCHIVE_FILE_NAME: &str = "image.tar";

/// One entry of the archive's top-level `manifest.json`.
#[derive(Debug, Serialize)]
struct LoadManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Write `work_dir/image.tar` for `image`.
///
/// The archive holds `<config hex>.json`, one `<layer hex>/layer.tar` per
/// manifest layer in manifest order, and finally `manifest.json`.
pub fn create_load_archive(
    work_dir: &Path,
    image: &DockerImageProduct,
    layers: &LayerIndex,
) -> Result<PathBuf> {
    let layer_products = image.layers_in(layers)?;
    std::fs::create_dir_all(work_dir)?;
    let archive_path = work_dir.join(LOAD_ARCHIVE_FILE_NAME);

    let file = File::create(&archive_path).map_err(|e| {
        StrataError::ArchiveError(format!(
            "Failed to create {}: {}",
            archive_path.display(),
            e
        ))
    })?;
    let mut builder = tar::Builder::new(BufWriter::new(file));

    let config_name = format!("{}.json", image.config_digest()?.hex());
    append_file(&mut builder, &config_name, &image.config_path())?;

    let mut entry = LoadManifestEntry {
        config: config_name,
        layers: Vec::with_capacity(layer_products.len()),
    };
    for layer in &layer_products {
        let name = format!("{}/{}", layer.digest()?.hex(), LAYER_TAR_FILE_NAME);
        // A layer repeated in the manifest is stored once
        if !entry.layers.contains(&name) {
            append_file(&mut builder, &name, &layer.tar_path())?;
        }
        entry.layers.push(name);
    }

    let manifest = serde_json::to_vec(&[entry])?;
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "manifest.json", manifest.as_slice())
        .map_err(|e| StrataError::ArchiveError(format!("Failed to append manifest.json: {}", e)))?;

    let mut writer = builder
        .into_inner()
        .map_err(|e| StrataError::ArchiveError(format!("Failed to finish archive: {}", e)))?;
    writer.flush()?;

    tracing::debug!(
        path = %archive_path.display(),
        layers = layer_products.len(),
        "Wrote daemon load archive"
    );
    Ok(archive_path)
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, name: &str, source: &Path) -> Result<()> {
    let mut file = File::open(source).map_err(|e| StrataError::SourceUnavailable {
        path: source.display().to_string(),
        message: e.to_string(),
    })?;
    builder
        .append_file(name, &mut file)
        .map_err(|e| StrataError::ArchiveError(format!("Failed to append {}: {}", name, e)))
}

/// Run `docker load --input <archive>`.
pub async fn docker_load(archive: &Path) -> Result<()> {
    let output = tokio::process::Command::new("docker")
        .arg("load")
        .arg("--input")
        .arg(archive)
        .output()
        .await
        .map_err(|e| StrataError::Other(format!("Failed to run docker load: {}", e)))?;

    if !output.status.success() {
        return Err(StrataError::Other(format!(
            "docker load exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    tracing::info!(
        archive = %archive.display(),
        output = %String::from_utf8_lossy(&output.stdout).trim(),
        "Loaded image into docker"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{LayerOptions, LayerProduct};
    use std::collections::BTreeMap;
    use std::io::Read;
    use strata_core::config::BuildConfig;
    use tempfile::TempDir;

    fn make_layer(root: &Path, name: &str, content: &str) -> LayerProduct {
        let tar = root.join(format!("{}.tar", name));
        std::fs::write(&tar, content).unwrap();
        LayerProduct::write(&root.join(name), &tar, LayerOptions::default()).unwrap()
    }

    fn read_entries(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    #[test]
    fn test_create_load_archive_layout() {
        let tmp = TempDir::new().unwrap();
        let base = make_layer(tmp.path(), "base", "base content");
        let app = make_layer(tmp.path(), "app", "app content");
        let image = DockerImageProduct::assemble(
            &tmp.path().join("image"),
            &[base.clone()],
            &[app.clone()],
            &[],
            &BTreeMap::new(),
            &BuildConfig::default(),
        )
        .unwrap();
        let mut index = LayerIndex::new();
        index.extend(vec![base.clone(), app.clone()]).unwrap();

        let archive = create_load_archive(&tmp.path().join("work"), &image, &index).unwrap();
        let entries = read_entries(&archive);

        let config_name = format!("{}.json", image.config_digest().unwrap().hex());
        let base_name = format!("{}/layer.tar", base.digest().unwrap().hex());
        let app_name = format!("{}/layer.tar", app.digest().unwrap().hex());
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![config_name.as_str(), base_name.as_str(), app_name.as_str(), "manifest.json"]
        );

        assert_eq!(entries[0].1, std::fs::read(image.config_path()).unwrap());
        assert_eq!(entries[1].1, b"base content");
        assert_eq!(entries[2].1, b"app content");

        let manifest: serde_json::Value = serde_json::from_slice(&entries[3].1).unwrap();
        assert_eq!(
            manifest,
            serde_json::json!([{"Config": config_name, "Layers": [base_name, app_name]}])
        );
    }

    #[test]
    fn test_create_load_archive_missing_layer() {
        let tmp = TempDir::new().unwrap();
        let app = make_layer(tmp.path(), "app", "app content");
        let image = DockerImageProduct::assemble(
            &tmp.path().join("image"),
            &[],
            &[app],
            &[],
            &BTreeMap::new(),
            &BuildConfig::default(),
        )
        .unwrap();

        let work = tmp.path().join("work");
        let result = create_load_archive(&work, &image, &LayerIndex::new());
        assert!(matches!(result, Err(StrataError::MissingLayer(_))));
        assert!(!work.join(LOAD_ARCHIVE_FILE_NAME).exists());
    }
}
