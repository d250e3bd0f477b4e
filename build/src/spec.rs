//! Build request types.
//!
//! A [`BuildSpec`] describes one image build: the base reference, the layer to
//! inject, the publish target, and the metadata to stamp onto the result. It
//! is constructed once per invocation and never mutated afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use inlay_core::error::{BuildError, Result};
use oci_distribution::Reference;
use serde::Serialize;

/// Sentinel base reference meaning "no base image at all".
pub const SCRATCH: &str = "scratch";

/// Target OS/architecture pair, serialized as `"os/arch"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

impl FromStr for Platform {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((os, arch)) if !os.is_empty() && !arch.is_empty() && !arch.contains('/') => {
                Ok(Platform::new(os, arch))
            }
            _ => Err(BuildError::Config(format!(
                "invalid platform '{}': expected <os>/<arch>",
                s
            ))),
        }
    }
}

/// Destination transport for a finished image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TargetType {
    /// Push to a remote registry
    Remote,
    /// Load into the local container daemon
    LocalDaemon,
    /// Write a self-contained archive to disk
    LocalFile,
}

impl FromStr for TargetType {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REMOTE" => Ok(TargetType::Remote),
            "LOCAL_DAEMON" => Ok(TargetType::LocalDaemon),
            "LOCAL_FILE" => Ok(TargetType::LocalFile),
            other => Err(BuildError::Config(format!(
                "invalid target type '{}': expected REMOTE, LOCAL_DAEMON, or LOCAL_FILE",
                other
            ))),
        }
    }
}

/// Publish destination. For `LocalFile` the repo field is the output path
/// (empty means `image.tar`); for the other types it is an image reference.
#[derive(Debug, Clone, Serialize)]
pub struct Target {
    pub repo: String,
    pub target_type: TargetType,
}

/// The filesystem tree to inject and where it lands inside the image.
#[derive(Debug, Clone, Serialize)]
pub struct InjectLayer {
    pub platform: Platform,
    pub source_path: PathBuf,
    pub destination_path: String,
    pub destination_chown: bool,
    pub entrypoint: String,
}

/// Immutable description of one build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSpec {
    pub base_ref: String,
    pub inject: InjectLayer,
    pub target: Target,
    pub author: String,
    pub annotations: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
}

impl BuildSpec {
    /// Check the invariants that must hold before the pipeline starts:
    /// the source tree exists and, unless the target writes to a local file,
    /// the target repo parses as an image reference.
    pub fn validate(&self) -> Result<()> {
        let meta = std::fs::metadata(&self.inject.source_path).map_err(|e| {
            BuildError::Config(format!(
                "source path {} is not readable: {}",
                self.inject.source_path.display(),
                e
            ))
        })?;
        if !meta.is_dir() {
            return Err(BuildError::Config(format!(
                "source path {} is not a directory",
                self.inject.source_path.display()
            )));
        }

        if self.target.target_type != TargetType::LocalFile {
            if self.target.repo.is_empty() {
                return Err(BuildError::Config(
                    "target repo is required for REMOTE and LOCAL_DAEMON targets".to_string(),
                ));
            }
            self.target
                .repo
                .parse::<Reference>()
                .map_err(|e| BuildError::InvalidReference {
                    reference: self.target.repo.clone(),
                    message: e.to_string(),
                })?;
        }

        Ok(())
    }
}

/// Provenance captured when the base image is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaseImageMetadata {
    /// Human-readable base reference, or `"scratch"`.
    pub name: String,
    /// Digest of the base image index; empty for `scratch`.
    pub digest: String,
}

impl BaseImageMetadata {
    pub fn scratch() -> Self {
        Self {
            name: SCRATCH.to_string(),
            digest: String::new(),
        }
    }
}
