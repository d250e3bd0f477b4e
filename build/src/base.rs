//! Base image resolution.
//!
//! Fetches the base image's manifest index, selects the manifest for the
//! requested platform and pulls its config. Layer blobs stay remote until
//! publish time.

use inlay_core::error::{BuildError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciManifest};
use oci_distribution::{Client, Reference};

use crate::context::BuildContext;
use crate::image::{ConfigFile, Image};
use crate::spec::{BaseImageMetadata, Platform, SCRATCH};

/// A registry client with the default secure transport.
pub fn new_client() -> Client {
    Client::new(ClientConfig {
        protocol: ClientProtocol::Https,
        ..Default::default()
    })
}

/// Resolve a base reference to a platform-specific image.
///
/// `scratch` short-circuits to an empty image whose architecture and OS come
/// from the requested platform. Anything else must name a multi-platform
/// index; the entry matching the platform exactly is fetched.
pub async fn resolve(
    ctx: &BuildContext,
    base_ref: &str,
    platform: &Platform,
) -> Result<(Image, BaseImageMetadata)> {
    if base_ref == SCRATCH {
        tracing::info!(platform = %platform, "using empty base image");
        return Ok((Image::scratch(platform)?, BaseImageMetadata::scratch()));
    }

    let reference = base_ref
        .parse::<Reference>()
        .map_err(|e| BuildError::InvalidReference {
            reference: base_ref.to_string(),
            message: e.to_string(),
        })?;
    let registry = reference.resolve_registry().to_string();
    let auth = ctx.keychain().resolve_auth(&registry);
    let client = new_client();

    tracing::info!(base = %reference, platform = %platform, "resolving base image");

    let (manifest, index_digest) = ctx
        .run_cancellable(async {
            client
                .pull_manifest(&reference, &auth)
                .await
                .map_err(|e| BuildError::RegistryFetch {
                    registry: registry.clone(),
                    message: format!("failed to pull manifest for {}: {}", reference, e),
                })
        })
        .await?;

    let index = match manifest {
        OciManifest::ImageIndex(index) => index,
        OciManifest::Image(_) => {
            return Err(BuildError::UnsupportedMediaType(format!(
                "{} is not a multi-platform image index",
                reference
            )));
        }
    };

    let platform_digest = select_platform_digest(&index.manifests, platform).ok_or_else(|| {
        BuildError::PlatformNotFound {
            platform: platform.to_string(),
            reference: reference.whole(),
        }
    })?;

    let pinned = Reference::with_digest(
        reference.registry().to_string(),
        reference.repository().to_string(),
        platform_digest.clone(),
    );
    let (image_manifest, manifest_digest) = ctx
        .run_cancellable(async {
            client
                .pull_image_manifest(&pinned, &auth)
                .await
                .map_err(|e| BuildError::RegistryFetch {
                    registry: registry.clone(),
                    message: format!("failed to pull platform manifest {}: {}", platform_digest, e),
                })
        })
        .await?;

    let mut config_bytes: Vec<u8> = Vec::new();
    ctx.run_cancellable(async {
        client
            .pull_blob(&pinned, &image_manifest.config, &mut config_bytes)
            .await
            .map_err(|e| BuildError::RegistryFetch {
                registry: registry.clone(),
                message: format!("failed to pull config blob: {}", e),
            })
    })
    .await?;

    let config: ConfigFile = serde_json::from_slice(&config_bytes)
        .map_err(|e| BuildError::ConfigRead(e.to_string()))?;

    tracing::debug!(
        digest = %manifest_digest,
        layers = image_manifest.layers.len(),
        "base image resolved"
    );

    let metadata = BaseImageMetadata {
        name: reference.whole(),
        digest: index_digest,
    };
    Ok((Image::from_base(&pinned, image_manifest, config), metadata))
}

/// Find the index entry exactly matching the platform's os and architecture.
///
/// No fallback: a near-miss variant or a platform-less attestation entry is
/// never selected.
fn select_platform_digest(manifests: &[ImageIndexEntry], platform: &Platform) -> Option<String> {
    manifests
        .iter()
        .find(|entry| {
            entry.platform.as_ref().map_or(false, |p| {
                p.os == platform.os && p.architecture == platform.arch
            })
        })
        .map(|entry| entry.digest.clone())
}
