//! Image assembly.
//!
//! Appends the injected layer to the base image and rewrites the runtime
//! config: working directory, entrypoint, environment and labels. All
//! timestamps in the result are fixed at the epoch so assembly is
//! deterministic.

use std::collections::BTreeMap;

use inlay_core::error::Result;

use crate::image::{HistoryEntry, Image};
use crate::layer::Layer;
use crate::spec::{BaseImageMetadata, BuildSpec};

const CREATED_EPOCH: &str = "1970-01-01T00:00:00Z";
const CREATED_BY: &str = "inlay build";

pub const BASE_NAME_LABEL: &str = "org.opencontainers.image.base.name";
pub const BASE_DIGEST_LABEL: &str = "org.opencontainers.image.base.digest";

/// Produce the final image from the base, the built layer and the spec.
pub fn assemble(
    base: &Image,
    layer: Layer,
    spec: &BuildSpec,
    base_meta: &BaseImageMetadata,
) -> Result<Image> {
    let image = base.append_layer(layer)?;

    let mut config = image.config.clone();
    config.created = Some(CREATED_EPOCH.to_string());
    config.history.push(HistoryEntry {
        created: Some(CREATED_EPOCH.to_string()),
        created_by: Some(CREATED_BY.to_string()),
        ..Default::default()
    });

    // Build/daemon bookkeeping from the base does not describe this image.
    config.container = None;
    config.container_config = None;
    config.docker_version = None;

    config.author = if spec.author.is_empty() {
        None
    } else {
        Some(spec.author.clone())
    };

    let mut run = config.config.take().unwrap_or_default();
    run.working_dir = Some(spec.inject.destination_path.clone());
    run.entrypoint = Some(vec![spec.inject.entrypoint.clone()]);
    run.cmd = None;

    // Spec env is appended after the base env, never merged into it. A key
    // present in both appears twice with the spec value last, which is the
    // one the runtime applies.
    if !spec.env.is_empty() {
        let mut env = run.env.take().unwrap_or_default();
        for (key, value) in &spec.env {
            env.push(format!("{}={}", key, value));
        }
        run.env = Some(env);
    }

    // Labels start fresh from provenance, then spec annotations overwrite.
    let mut labels = BTreeMap::new();
    labels.insert(BASE_NAME_LABEL.to_string(), base_meta.name.clone());
    if !base_meta.digest.is_empty() {
        labels.insert(BASE_DIGEST_LABEL.to_string(), base_meta.digest.clone());
    }
    for (key, value) in &spec.annotations {
        labels.insert(key.clone(), value.clone());
    }
    run.labels = Some(labels);

    config.config = Some(run);
    image.with_config(config)
}
