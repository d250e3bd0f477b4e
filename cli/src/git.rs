//! Git metadata for automatic version annotations.
//!
//! Shells out to the `git` binary rather than linking a git library; the
//! three queries involved are stable plumbing commands and the feature is
//! optional when no repository is present.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use inlay_core::error::{BuildError, Result};

pub const REVISION_ANNOTATION: &str = "org.opencontainers.image.revision";
pub const VERSION_ANNOTATION: &str = "org.opencontainers.image.version";

/// State of the working tree at HEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitInfo {
    pub commit: String,
    pub dirty: bool,
    /// Tags pointing at HEAD.
    pub tags: Vec<String>,
}

/// Read git state for a directory, or `None` when it is not inside a work
/// tree (or git is not installed).
pub fn collect(dir: &Path) -> Option<GitInfo> {
    let commit = git_output(dir, &["rev-parse", "HEAD"])?;
    let status = git_output(dir, &["status", "--porcelain"])?;
    let tags = git_output(dir, &["tag", "--points-at", "HEAD"])?;

    Some(GitInfo {
        commit,
        dirty: !status.is_empty(),
        tags: tags.lines().map(str::to_string).collect(),
    })
}

fn git_output(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).current_dir(dir).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Derive revision and version annotations from git state.
///
/// At most one tag may point at HEAD. That tag must be a plain `X.Y.Z`
/// version; with no tag the version is a snapshot of the full commit hash.
/// A dirty tree marks both the revision and the version.
pub fn version_annotations(info: &GitInfo) -> Result<BTreeMap<String, String>> {
    if info.tags.len() > 1 {
        return Err(BuildError::Config(format!(
            "multiple tags found for commit {}: {}",
            info.commit,
            info.tags.join(", ")
        )));
    }

    let suffix = if info.dirty { "-dirty" } else { "" };
    let revision = format!("{}{}", info.commit, suffix);

    let mut version = match info.tags.first() {
        Some(tag) => {
            let release = regex::Regex::new(r"^\d+\.\d+\.\d+$")
                .map_err(|e| BuildError::Config(e.to_string()))?;
            if !release.is_match(tag) {
                return Err(BuildError::Config(format!(
                    "tag {} is not a valid version",
                    tag
                )));
            }
            tag.clone()
        }
        None => format!("snapshot-{}", info.commit),
    };
    version.push_str(suffix);

    Ok(BTreeMap::from([
        (REVISION_ANNOTATION.to_string(), revision),
        (VERSION_ANNOTATION.to_string(), version),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(commit: &str, dirty: bool, tags: &[&str]) -> GitInfo {
        GitInfo {
            commit: commit.to_string(),
            dirty,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_clean_release_tag() {
        let annotations =
            version_annotations(&info("0123456789abcdef0123", false, &["1.2.3"])).unwrap();
        assert_eq!(annotations[VERSION_ANNOTATION], "1.2.3");
        assert_eq!(annotations[REVISION_ANNOTATION], "0123456789abcdef0123");
    }

    #[test]
    fn test_dirty_tree_marks_revision_and_version() {
        let annotations = version_annotations(&info("0123456789abcdef0123", true, &[])).unwrap();
        assert_eq!(
            annotations[REVISION_ANNOTATION],
            "0123456789abcdef0123-dirty"
        );
        assert_eq!(
            annotations[VERSION_ANNOTATION],
            "snapshot-0123456789abcdef0123-dirty"
        );
    }

    #[test]
    fn test_dirty_release_tag_gets_suffix() {
        let annotations =
            version_annotations(&info("0123456789abcdef0123", true, &["1.2.3"])).unwrap();
        assert_eq!(annotations[VERSION_ANNOTATION], "1.2.3-dirty");
    }

    #[test]
    fn test_non_release_tag_is_an_error() {
        let err = version_annotations(&info("0123456789abcdef0123", false, &["v1.2.3"]))
            .unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
        assert!(err.to_string().contains("not a valid version"));
    }

    #[test]
    fn test_multiple_tags_is_an_error() {
        let err =
            version_annotations(&info("0123456789abcdef0123", false, &["1.2.3", "nightly"]))
                .unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
        assert!(err.to_string().contains("multiple tags"));
    }

    #[test]
    fn test_collect_outside_repo() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(collect(dir.path()).is_none());
    }
}
