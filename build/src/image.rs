//! In-memory image model.
//!
//! An [`Image`] pairs an OCI manifest with its decoded config file and a
//! record of where each layer's bytes live. Mutation is copy-on-write: every
//! method that changes an image returns a new value, so intermediate states
//! stay usable.

use std::collections::BTreeMap;
use std::path::PathBuf;

use inlay_core::error::{BuildError, Result};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest};
use oci_distribution::Reference;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::layer::Layer;
use crate::spec::Platform;

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Runtime settings embedded in the image config.
///
/// Field names follow the on-disk config format. Unknown fields round-trip
/// through `extra` so base image settings are never silently dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

/// The image config blob, decoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RunConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Where a layer's compressed bytes can be obtained.
#[derive(Debug, Clone)]
pub enum LayerSource {
    /// Present in a remote registry; fetched on demand at publish time.
    Remote {
        reference: Reference,
        descriptor: OciDescriptor,
    },
    /// Built locally and sitting in a temp file.
    Local {
        path: PathBuf,
        descriptor: OciDescriptor,
    },
}

impl LayerSource {
    pub fn descriptor(&self) -> &OciDescriptor {
        match self {
            LayerSource::Remote { descriptor, .. } => descriptor,
            LayerSource::Local { descriptor, .. } => descriptor,
        }
    }
}

/// A container image: manifest, config and layer sources.
#[derive(Debug, Clone)]
pub struct Image {
    pub manifest: OciImageManifest,
    pub config: ConfigFile,
    pub layers: Vec<LayerSource>,
}

impl Image {
    /// An empty image with no layers, typed as an OCI image.
    ///
    /// The architecture and OS come from the requested platform since there
    /// is no base config to inherit them from.
    pub fn scratch(platform: &Platform) -> Result<Self> {
        let config = ConfigFile {
            architecture: platform.arch.clone(),
            os: platform.os.clone(),
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: Vec::new(),
            },
            ..Default::default()
        };
        let config_bytes = serde_json::to_vec(&config)?;
        let config_descriptor = descriptor(
            OCI_CONFIG_MEDIA_TYPE,
            &sha256_digest(&config_bytes),
            config_bytes.len() as i64,
        )?;
        let manifest = build_manifest(OCI_MANIFEST_MEDIA_TYPE, &config_descriptor, &[])?;
        Ok(Self {
            manifest,
            config,
            layers: Vec::new(),
        })
    }

    /// Assemble an image from a fetched manifest and decoded config.
    ///
    /// All existing layers are recorded as remote, addressed through the base
    /// image reference.
    pub fn from_base(
        reference: &Reference,
        manifest: OciImageManifest,
        config: ConfigFile,
    ) -> Self {
        let layers = manifest
            .layers
            .iter()
            .map(|d| LayerSource::Remote {
                reference: reference.clone(),
                descriptor: d.clone(),
            })
            .collect();
        Self {
            manifest,
            config,
            layers,
        }
    }

    /// The manifest media type, defaulting to OCI when the base left it unset.
    pub fn manifest_media_type(&self) -> &str {
        self.manifest
            .media_type
            .as_deref()
            .unwrap_or(OCI_MANIFEST_MEDIA_TYPE)
    }

    /// The layer media type matching this image's manifest family.
    ///
    /// Only the OCI and Docker v2 families are understood; anything else is
    /// rejected rather than guessed at.
    pub fn layer_media_type(&self) -> Result<&'static str> {
        match self.manifest_media_type() {
            OCI_MANIFEST_MEDIA_TYPE => Ok(OCI_LAYER_MEDIA_TYPE),
            DOCKER_MANIFEST_MEDIA_TYPE => Ok(DOCKER_LAYER_MEDIA_TYPE),
            other => Err(BuildError::UnsupportedMediaType(other.to_string())),
        }
    }

    /// The config media type matching this image's manifest family.
    pub fn config_media_type(&self) -> Result<&'static str> {
        match self.manifest_media_type() {
            OCI_MANIFEST_MEDIA_TYPE => Ok(OCI_CONFIG_MEDIA_TYPE),
            DOCKER_MANIFEST_MEDIA_TYPE => Ok(DOCKER_CONFIG_MEDIA_TYPE),
            other => Err(BuildError::UnsupportedMediaType(other.to_string())),
        }
    }

    /// Serialized manifest bytes, as they will be published.
    pub fn manifest_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.manifest)?)
    }

    /// Serialized config bytes, as they will be published.
    pub fn config_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.config)?)
    }

    /// The image digest: sha256 of the serialized manifest.
    pub fn digest(&self) -> Result<String> {
        Ok(sha256_digest(&self.manifest_bytes()?))
    }

    /// Append a locally built layer, returning the updated image.
    pub fn append_layer(&self, layer: Layer) -> Result<Self> {
        if self.config.rootfs.fs_type != "layers" {
            return Err(BuildError::LayerAppend(format!(
                "unsupported rootfs type '{}'",
                self.config.rootfs.fs_type
            )));
        }

        let layer_descriptor = descriptor(&layer.media_type, &layer.digest, layer.size)?;

        let mut image = self.clone();
        image.config.rootfs.diff_ids.push(layer.diff_id.clone());
        image.manifest.layers.push(layer_descriptor.clone());
        image.layers.push(LayerSource::Local {
            path: layer.path,
            descriptor: layer_descriptor,
        });
        image.rebuild_manifest()
    }

    /// Replace the config file, returning the updated image.
    pub fn with_config(&self, config: ConfigFile) -> Result<Self> {
        let mut image = self.clone();
        image.config = config;
        image.rebuild_manifest()
    }

    /// Recompute the config descriptor and manifest after a mutation.
    fn rebuild_manifest(mut self) -> Result<Self> {
        let config_bytes = serde_json::to_vec(&self.config)?;
        let config_descriptor = descriptor(
            self.config_media_type()?,
            &sha256_digest(&config_bytes),
            config_bytes.len() as i64,
        )?;
        let layer_descriptors: Vec<OciDescriptor> =
            self.layers.iter().map(|l| l.descriptor().clone()).collect();
        self.manifest = build_manifest(
            self.manifest_media_type(),
            &config_descriptor,
            &layer_descriptors,
        )?;
        Ok(self)
    }
}

/// Build an OCI descriptor from its three required fields.
fn descriptor(media_type: &str, digest: &str, size: i64) -> Result<OciDescriptor> {
    Ok(serde_json::from_value(json!({
        "mediaType": media_type,
        "digest": digest,
        "size": size,
    }))?)
}

/// Build an image manifest from a config descriptor and layer descriptors.
fn build_manifest(
    media_type: &str,
    config: &OciDescriptor,
    layers: &[OciDescriptor],
) -> Result<OciImageManifest> {
    Ok(serde_json::from_value(json!({
        "schemaVersion": 2,
        "mediaType": media_type,
        "config": serde_json::to_value(config)?,
        "layers": layers
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?,
    }))?)
}

/// Hex sha256 digest of a byte slice, with the `sha256:` prefix.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
