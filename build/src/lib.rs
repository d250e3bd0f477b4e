//! Image build pipeline.
//!
//! Takes a directory on disk, layers it onto a platform-selected base image
//! and delivers the result to a registry, the local daemon or a tarball.
//! [`run`] drives the whole pipeline; the stages live in their own modules.

pub mod assemble;
pub mod base;
pub mod cleanup;
pub mod context;
pub mod image;
pub mod keychain;
pub mod layer;
pub mod publish;
pub mod spec;
pub mod tarball;

use inlay_core::error::Result;

pub use cleanup::CleanupRegistry;
pub use context::BuildContext;
pub use spec::BuildSpec;

/// Run a build end to end and return what was published.
pub async fn run(ctx: &BuildContext, spec: &BuildSpec) -> Result<String> {
    spec.validate().map_err(|e| e.in_stage("validate"))?;

    let (base_image, base_meta) =
        base::resolve(ctx, &spec.base_ref, &spec.inject.platform)
            .await
            .map_err(|e| e.in_stage("resolve-base"))?;

    let layer_media_type = base_image
        .layer_media_type()
        .map_err(|e| e.in_stage("resolve-base"))?;
    let layer = layer::build(ctx, &spec.inject, layer_media_type)
        .map_err(|e| e.in_stage("build-layer"))?;

    let image = assemble::assemble(&base_image, layer, spec, &base_meta)
        .map_err(|e| e.in_stage("assemble"))?;

    tracing::info!(digest = %image.digest()?, "image assembled");

    ctx.ensure_active()?;
    publish::publish(ctx, &image, spec)
        .await
        .map_err(|e| e.in_stage("publish"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MultiKeychain;
    use crate::spec::{InjectLayer, Target, TargetType};
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use std::io::Read;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn test_context(temp: &TempDir) -> BuildContext {
        BuildContext::new(
            CancellationToken::new(),
            Arc::new(MultiKeychain::new(vec![])),
            CleanupRegistry::new(),
        )
        .with_temp_dir(temp.path().to_path_buf())
    }

    #[tokio::test]
    async fn test_scratch_to_file_end_to_end() {
        let temp = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("app"), b"#!/bin/sh\n").unwrap();
        let out = temp.path().join("image.tar");

        let spec = BuildSpec {
            base_ref: "scratch".to_string(),
            inject: InjectLayer {
                platform: "linux/amd64".parse().unwrap(),
                source_path: source.path().to_path_buf(),
                destination_path: "/app".to_string(),
                destination_chown: true,
                entrypoint: "/app/app".to_string(),
            },
            target: Target {
                repo: out.to_str().unwrap().to_string(),
                target_type: TargetType::LocalFile,
            },
            author: "tester".to_string(),
            annotations: BTreeMap::new(),
            env: BTreeMap::new(),
        };

        let ctx = test_context(&temp);
        let produced = run(&ctx, &spec).await.unwrap();
        assert_eq!(produced, out.to_str().unwrap());

        // Walk the produced archive: one layer, config with the expected
        // runtime settings.
        let mut archive = tar::Archive::new(std::fs::File::open(&out).unwrap());
        let mut config_json = None;
        let mut layer_bytes = None;
        let mut manifest_json = None;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            if name == "manifest.json" {
                manifest_json = Some(data);
            } else if name.ends_with(".json") {
                config_json = Some(data);
            } else if name.ends_with(".tar.gz") {
                layer_bytes = Some(data);
            }
        }

        let manifest: serde_json::Value =
            serde_json::from_slice(&manifest_json.unwrap()).unwrap();
        assert_eq!(manifest[0]["Layers"].as_array().unwrap().len(), 1);

        let config: serde_json::Value = serde_json::from_slice(&config_json.unwrap()).unwrap();
        assert_eq!(config["config"]["WorkingDir"], "/app");
        assert_eq!(config["config"]["Entrypoint"][0], "/app/app");
        assert!(config["config"]["Cmd"].is_null());
        assert_eq!(
            config["config"]["Labels"]["org.opencontainers.image.base.name"],
            "scratch"
        );
        assert_eq!(config["created"], "1970-01-01T00:00:00Z");

        // The injected file sits under the destination with normalized
        // ownership and timestamps.
        let layer_bytes = layer_bytes.unwrap();
        let decoder = GzDecoder::new(&layer_bytes[..]);
        let mut layer = tar::Archive::new(decoder);
        let mut found_app = false;
        for entry in layer.entries().unwrap() {
            let entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            if name == "app/app" {
                found_app = true;
                let header = entry.header();
                assert_eq!(header.mtime().unwrap(), 0);
                assert_eq!(header.uid().unwrap(), 0);
                assert_eq!(header.gid().unwrap(), 0);
                assert_eq!(header.username().unwrap(), Some("root"));
            }
        }
        assert!(found_app);
    }

    #[tokio::test]
    async fn test_invalid_spec_fails_in_validate_stage() {
        let temp = TempDir::new().unwrap();
        let spec = BuildSpec {
            base_ref: "scratch".to_string(),
            inject: InjectLayer {
                platform: "linux/amd64".parse().unwrap(),
                source_path: temp.path().join("missing"),
                destination_path: "/app".to_string(),
                destination_chown: true,
                entrypoint: "/app/app".to_string(),
            },
            target: Target {
                repo: "out.tar".to_string(),
                target_type: TargetType::LocalFile,
            },
            author: String::new(),
            annotations: BTreeMap::new(),
            env: BTreeMap::new(),
        };

        let ctx = test_context(&temp);
        let err = run(&ctx, &spec).await.unwrap_err();
        assert!(err.to_string().starts_with("validate:"));
    }
}
