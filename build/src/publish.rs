//! Publish transports.
//!
//! Dispatches a finished image to one of three destinations: a remote
//! registry, the local container daemon, or a tarball on disk. Base layers
//! that never left the registry are fetched here, just before they are
//! needed.

use std::path::{Path, PathBuf};

use bollard::image::ImportImageOptions;
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use inlay_core::error::{BuildError, Result};
use oci_distribution::client::{Config, ImageLayer};
use oci_distribution::{Reference, RegistryOperation};
use tokio::io::AsyncWriteExt;

use crate::base::new_client;
use crate::context::BuildContext;
use crate::image::{Image, LayerSource};
use crate::spec::{BuildSpec, TargetType};
use crate::tarball;

/// Publish the image to the requested target, returning what was produced: a
/// digest-pinned reference for the registry, the tagged name for the daemon,
/// or the output path for a file.
pub async fn publish(ctx: &BuildContext, image: &Image, spec: &BuildSpec) -> Result<String> {
    match spec.target.target_type {
        TargetType::Remote => publish_remote(ctx, image, &spec.target.repo).await,
        TargetType::LocalDaemon => publish_daemon(ctx, image, &spec.target.repo).await,
        TargetType::LocalFile => publish_file(ctx, image, &spec.target.repo).await,
    }
}

/// Push the image to a remote registry.
async fn publish_remote(ctx: &BuildContext, image: &Image, repo: &str) -> Result<String> {
    let reference = parse_push_reference(repo)?;
    let registry = reference.resolve_registry().to_string();
    let auth = ctx.keychain().resolve_auth(&registry);
    let client = new_client();

    tracing::info!(target = %reference, "publishing to registry");

    let paths = materialize_layers(ctx, image).await?;
    let mut layers = Vec::with_capacity(paths.len());
    for (descriptor, path) in image.manifest.layers.iter().zip(&paths) {
        let data = std::fs::read(path)?;
        layers.push(ImageLayer::new(data, descriptor.media_type.clone(), None));
    }
    let config = Config::new(
        image.config_bytes()?,
        image.config_media_type()?.to_string(),
        None,
    );

    let response = ctx
        .run_cancellable(async {
            client
                .push(
                    &reference,
                    &layers,
                    config,
                    &auth,
                    Some(image.manifest.clone()),
                )
                .await
                .map_err(|e| BuildError::RemotePublish {
                    registry: registry.clone(),
                    message: e.to_string(),
                })
        })
        .await?;

    let digest = image.digest()?;
    tracing::info!(
        manifest_url = %response.manifest_url,
        digest = %digest,
        "image published"
    );
    let pinned = Reference::with_digest(
        reference.registry().to_string(),
        reference.repository().to_string(),
        digest,
    );
    Ok(pinned.whole())
}

/// Load the image into the local container daemon.
async fn publish_daemon(ctx: &BuildContext, image: &Image, repo: &str) -> Result<String> {
    let reference = parse_push_reference(repo)?;

    tracing::info!(target = %reference, "publishing to local daemon");

    let paths = materialize_layers(ctx, image).await?;
    let layer_paths: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
    let repo_tags = vec![reference.whole()];

    let (tar_file, tar_path) = ctx.create_temp_file("inlay-load-", ".tar")?;
    tarball::write(image, &layer_paths, &repo_tags, tar_file)
        .map_err(|e| BuildError::DaemonPublish(e.to_string()))?;
    let body = std::fs::read(&tar_path)
        .map(Bytes::from)
        .map_err(|e| BuildError::DaemonPublish(e.to_string()))?;

    let docker = Docker::connect_with_local_defaults()
        .map_err(|e| BuildError::DaemonPublish(e.to_string()))?;

    ctx.run_cancellable(async {
        let mut stream = docker.import_image(ImportImageOptions::default(), body, None);
        while let Some(message) = stream.next().await {
            let info = message.map_err(|e| BuildError::DaemonPublish(e.to_string()))?;
            if let Some(status) = info.status {
                tracing::debug!(%status, "daemon import");
            }
        }
        Ok(())
    })
    .await?;

    tracing::info!(target = %reference, "image loaded into daemon");
    Ok(reference.whole())
}

/// Write the image tarball to disk.
///
/// The archive is written to a temp path next to the destination and renamed
/// into place, so an interrupted build never leaves a half-written file under
/// the final name.
async fn publish_file(ctx: &BuildContext, image: &Image, repo: &str) -> Result<String> {
    let out = if repo.is_empty() { "image.tar" } else { repo };
    let tmp = format!("{}.tmp", out);
    ctx.cleanup().register(PathBuf::from(&tmp));

    tracing::info!(path = %out, "writing image tarball");

    let paths = materialize_layers(ctx, image).await?;
    let layer_paths: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();

    let file = std::fs::File::create(&tmp).map_err(|e| BuildError::FileWrite {
        path: tmp.clone(),
        message: e.to_string(),
    })?;
    tarball::write(image, &layer_paths, &[], file).map_err(|e| BuildError::FileWrite {
        path: tmp.clone(),
        message: e.to_string(),
    })?;
    std::fs::rename(&tmp, out).map_err(|e| BuildError::FileWrite {
        path: out.to_string(),
        message: e.to_string(),
    })?;

    tracing::info!(path = %out, digest = %image.digest()?, "image tarball written");
    Ok(out.to_string())
}

/// Ensure every layer's compressed bytes are on local disk, fetching remote
/// base layers into registered temp files.
async fn materialize_layers(ctx: &BuildContext, image: &Image) -> Result<Vec<PathBuf>> {
    let client = new_client();
    let mut paths = Vec::with_capacity(image.layers.len());

    for source in &image.layers {
        match source {
            LayerSource::Local { path, .. } => paths.push(path.clone()),
            LayerSource::Remote {
                reference,
                descriptor,
            } => {
                let registry = reference.resolve_registry().to_string();
                let auth = ctx.keychain().resolve_auth(&registry);
                let (file, path) = ctx.create_temp_file("inlay-blob-", ".tar.gz")?;

                tracing::debug!(digest = %descriptor.digest, "fetching base layer");

                ctx.run_cancellable(async {
                    client
                        .auth(reference, &auth, RegistryOperation::Pull)
                        .await
                        .map_err(|e| BuildError::RegistryFetch {
                            registry: registry.clone(),
                            message: format!("failed to authenticate: {}", e),
                        })?;
                    let mut out = tokio::fs::File::from_std(file);
                    client
                        .pull_blob(reference, descriptor, &mut out)
                        .await
                        .map_err(|e| BuildError::RegistryFetch {
                            registry: registry.clone(),
                            message: format!(
                                "failed to pull layer {}: {}",
                                descriptor.digest, e
                            ),
                        })?;
                    out.flush().await?;
                    Ok(())
                })
                .await?;

                paths.push(path);
            }
        }
    }
    Ok(paths)
}

/// Parse a push target. The reference must carry a tag, not a digest; a
/// digest names content that does not exist until the push completes.
fn parse_push_reference(repo: &str) -> Result<Reference> {
    let reference = repo
        .parse::<Reference>()
        .map_err(|e| BuildError::InvalidReference {
            reference: repo.to_string(),
            message: e.to_string(),
        })?;
    if reference.digest().is_some() {
        return Err(BuildError::InvalidReference {
            reference: repo.to_string(),
            message: "cannot publish to a digest-pinned reference".to_string(),
        });
    }
    Ok(reference)
}
