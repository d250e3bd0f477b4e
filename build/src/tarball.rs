//! Tarball output in the daemon load format.
//!
//! The archive holds the config blob, each compressed layer and a
//! `manifest.json` describing them, which is what `docker load` and the
//! daemon's import endpoint expect.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use inlay_core::error::Result;
use serde::Serialize;
use tar::{EntryType, Header};

use crate::image::Image;

#[derive(Serialize)]
struct ManifestEntry<'a> {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: &'a [String],
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Write the image as a loadable tarball.
///
/// `layer_paths` must hold the compressed blob for each manifest layer, in
/// manifest order. `repo_tags` may be empty, in which case the loaded image
/// is addressable only by digest.
pub fn write<W: Write>(
    image: &Image,
    layer_paths: &[&Path],
    repo_tags: &[String],
    out: W,
) -> Result<()> {
    let mut builder = tar::Builder::new(out);

    let config_bytes = image.config_bytes()?;
    let config_name = format!("{}.json", digest_hex(&image.manifest.config.digest));
    append_bytes(&mut builder, &config_name, &config_bytes)?;

    let mut layer_names = Vec::with_capacity(layer_paths.len());
    for (descriptor, path) in image.manifest.layers.iter().zip(layer_paths) {
        let name = format!("{}.tar.gz", digest_hex(&descriptor.digest));
        let file = File::open(path)?;
        let mut header = entry_header(file.metadata()?.len());
        builder.append_data(&mut header, &name, file)?;
        layer_names.push(name);
    }

    let manifest = vec![ManifestEntry {
        config: config_name,
        repo_tags,
        layers: layer_names,
    }];
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    append_bytes(&mut builder, "manifest.json", &manifest_bytes)?;

    let mut out = builder.into_inner()?;
    out.flush()?;
    Ok(())
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = entry_header(data.len() as u64);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

fn entry_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::OCI_LAYER_MEDIA_TYPE;
    use crate::layer::Layer;
    use crate::spec::Platform;
    use std::collections::HashMap;
    use std::io::Read;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Image) {
        let dir = TempDir::new().unwrap();
        let blob_path = dir.path().join("layer.tar.gz");
        std::fs::write(&blob_path, b"not really gzip").unwrap();

        let platform = Platform {
            os: "linux".to_string(),
            arch: "amd64".to_string(),
        };
        let image = Image::scratch(&platform)
            .unwrap()
            .append_layer(Layer {
                path: blob_path,
                media_type: OCI_LAYER_MEDIA_TYPE.to_string(),
                digest: format!("sha256:{}", "ab".repeat(32)),
                diff_id: format!("sha256:{}", "cd".repeat(32)),
                size: 15,
            })
            .unwrap();
        (dir, image)
    }

    fn read_entries(data: &[u8]) -> HashMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().into_owned();
                let mut content = Vec::new();
                e.read_to_end(&mut content).unwrap();
                (name, content)
            })
            .collect()
    }

    #[test]
    fn test_tarball_layout() {
        let (_dir, image) = fixture();
        let layer_path = match &image.layers[0] {
            crate::image::LayerSource::Local { path, .. } => path.clone(),
            _ => unreachable!(),
        };
        let tags = vec!["ghcr.io/org/app:v1".to_string()];

        let mut out = Vec::new();
        write(&image, &[layer_path.as_path()], &tags, &mut out).unwrap();

        let entries = read_entries(&out);
        let layer_name = format!("{}.tar.gz", "ab".repeat(32));
        assert_eq!(entries[&layer_name], b"not really gzip");

        let manifest: serde_json::Value =
            serde_json::from_slice(&entries["manifest.json"]).unwrap();
        assert_eq!(manifest[0]["RepoTags"][0], "ghcr.io/org/app:v1");
        assert_eq!(manifest[0]["Layers"][0], layer_name);

        let config_name = manifest[0]["Config"].as_str().unwrap();
        let config: serde_json::Value = serde_json::from_slice(&entries[config_name]).unwrap();
        assert_eq!(config["os"], "linux");
    }

    #[test]
    fn test_tarball_empty_repo_tags() {
        let (_dir, image) = fixture();
        let layer_path = match &image.layers[0] {
            crate::image::LayerSource::Local { path, .. } => path.clone(),
            _ => unreachable!(),
        };

        let mut out = Vec::new();
        write(&image, &[layer_path.as_path()], &[], &mut out).unwrap();

        let entries = read_entries(&out);
        let manifest: serde_json::Value =
            serde_json::from_slice(&entries["manifest.json"]).unwrap();
        assert_eq!(manifest[0]["RepoTags"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_config_name_matches_manifest_digest() {
        let (_dir, image) = fixture();
        let layer_path = match &image.layers[0] {
            crate::image::LayerSource::Local { path, .. } => path.clone(),
            _ => unreachable!(),
        };

        let mut out = Vec::new();
        write(&image, &[layer_path.as_path()], &[], &mut out).unwrap();

        let entries = read_entries(&out);
        let expected = format!("{}.json", digest_hex(&image.manifest.config.digest));
        assert!(entries.contains_key(expected.as_str()));
    }
}
