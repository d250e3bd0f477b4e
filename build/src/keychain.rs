//! Registry credential resolution.
//!
//! Credentials come from an ordered chain of sources: explicit user/password
//! scoped to the target registry, the ambient Docker config file, then
//! provider-specific token helpers. Resolution for a host stops at the first
//! source that matches, and the chain is read-only after construction.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine;
use inlay_core::error::{BuildError, Result};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde::Deserialize;

/// A resolved username/password pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// One source of registry credentials.
pub trait Keychain: Send + Sync {
    /// Resolve credentials for a registry host, or decline.
    fn resolve(&self, registry: &str) -> Option<Credential>;
}

/// Explicit credentials scoped to exactly one registry host.
///
/// The host is taken from the target repo reference so that credentials
/// supplied for the publish target are never sent to the base registry.
pub struct StaticKeychain {
    registry: String,
    credential: Credential,
}

impl StaticKeychain {
    pub fn new(username: &str, password: &str, target_repo: &str) -> Result<Self> {
        let reference = target_repo
            .parse::<Reference>()
            .map_err(|e| BuildError::InvalidReference {
                reference: target_repo.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            registry: normalize_registry(reference.resolve_registry()),
            credential: Credential {
                username: username.to_string(),
                password: password.to_string(),
            },
        })
    }
}

impl Keychain for StaticKeychain {
    fn resolve(&self, registry: &str) -> Option<Credential> {
        if normalize_registry(registry) == self.registry {
            tracing::debug!(registry, "using explicit credentials");
            Some(self.credential.clone())
        } else {
            tracing::debug!(
                registry,
                target = %self.registry,
                "explicit credentials do not match registry, skipping"
            );
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

/// Ambient credentials from `~/.docker/config.json`.
pub struct DockerConfigKeychain {
    path: Option<PathBuf>,
}

impl DockerConfigKeychain {
    /// Use the default Docker config location.
    pub fn default_path() -> Self {
        Self {
            path: dirs::home_dir().map(|h| h.join(".docker").join("config.json")),
        }
    }

    /// Use a custom config file path.
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn load(&self) -> Option<DockerConfigFile> {
        let path = self.path.as_ref()?;
        let data = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&data) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "unreadable docker config");
                None
            }
        }
    }
}

impl Keychain for DockerConfigKeychain {
    fn resolve(&self, registry: &str) -> Option<Credential> {
        let config = self.load()?;
        let wanted = normalize_registry(registry);
        let entry = config.auths.iter().find_map(|(host, entry)| {
            // Hosts in docker config may carry a scheme prefix.
            let host = host
                .trim_start_matches("https://")
                .trim_start_matches("http://");
            let host = host.split('/').next().unwrap_or(host);
            (normalize_registry(host) == wanted).then_some(entry)
        })?;

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Some(Credential {
                username: username.clone(),
                password: password.clone(),
            });
        }

        let encoded = entry.auth.as_deref()?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Credential {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Token credentials for GitHub Container Registry.
pub struct GithubKeychain {
    token: Option<String>,
}

impl GithubKeychain {
    /// Read the token from `GITHUB_TOKEN` or `GH_TOKEN`.
    pub fn from_env() -> Self {
        let token = std::env::var("GITHUB_TOKEN")
            .or_else(|_| std::env::var("GH_TOKEN"))
            .ok()
            .filter(|t| !t.is_empty());
        Self { token }
    }

    #[cfg(test)]
    fn with_token(token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
        }
    }
}

impl Keychain for GithubKeychain {
    fn resolve(&self, registry: &str) -> Option<Credential> {
        if registry != "ghcr.io" {
            return None;
        }
        self.token.as_ref().map(|token| Credential {
            username: "token".to_string(),
            password: token.clone(),
        })
    }
}

/// Ordered dispatch over a chain of keychains; first match wins.
pub struct MultiKeychain {
    chain: Vec<Box<dyn Keychain>>,
}

impl MultiKeychain {
    pub fn new(chain: Vec<Box<dyn Keychain>>) -> Self {
        Self { chain }
    }

    /// The default ambient chain: Docker config, then provider helpers.
    pub fn ambient() -> Self {
        Self::new(vec![
            Box::new(DockerConfigKeychain::default_path()),
            Box::new(GithubKeychain::from_env()),
        ])
    }

    /// Resolve to the auth type consumed by the registry client.
    pub fn resolve_auth(&self, registry: &str) -> RegistryAuth {
        match self.resolve(registry) {
            Some(credential) => RegistryAuth::Basic(credential.username, credential.password),
            None => RegistryAuth::Anonymous,
        }
    }
}

impl Keychain for MultiKeychain {
    fn resolve(&self, registry: &str) -> Option<Credential> {
        self.chain.iter().find_map(|k| k.resolve(registry))
    }
}

/// Normalize Docker Hub host aliases to a single canonical name.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn docker_config(dir: &TempDir, content: &str) -> DockerConfigKeychain {
        let path = dir.path().join("config.json");
        fs::write(&path, content).unwrap();
        DockerConfigKeychain::new(path)
    }

    #[test]
    fn test_static_keychain_matches_target_registry() {
        let keychain = StaticKeychain::new("user", "pass", "ghcr.io/org/app:v1").unwrap();
        let credential = keychain.resolve("ghcr.io").unwrap();
        assert_eq!(credential.username, "user");
        assert_eq!(credential.password, "pass");
    }

    #[test]
    fn test_static_keychain_declines_other_registries() {
        let keychain = StaticKeychain::new("user", "pass", "ghcr.io/org/app:v1").unwrap();
        assert!(keychain.resolve("quay.io").is_none());
    }

    #[test]
    fn test_static_keychain_invalid_repo() {
        assert!(StaticKeychain::new("user", "pass", "not a reference").is_err());
    }

    #[test]
    fn test_docker_config_auth_field() {
        let dir = TempDir::new().unwrap();
        // base64("user:pass")
        let keychain = docker_config(
            &dir,
            r#"{"auths":{"ghcr.io":{"auth":"dXNlcjpwYXNz"}}}"#,
        );
        let credential = keychain.resolve("ghcr.io").unwrap();
        assert_eq!(credential.username, "user");
        assert_eq!(credential.password, "pass");
    }

    #[test]
    fn test_docker_config_username_password_fields() {
        let dir = TempDir::new().unwrap();
        let keychain = docker_config(
            &dir,
            r#"{"auths":{"quay.io":{"username":"u1","password":"p1"}}}"#,
        );
        let credential = keychain.resolve("quay.io").unwrap();
        assert_eq!(credential.username, "u1");
        assert_eq!(credential.password, "p1");
    }

    #[test]
    fn test_docker_config_hub_normalization() {
        let dir = TempDir::new().unwrap();
        let keychain = docker_config(
            &dir,
            r#"{"auths":{"https://index.docker.io/v1/":{"auth":"dXNlcjpwYXNz"}}}"#,
        );
        assert!(keychain.resolve("docker.io").is_some());
        assert!(keychain.resolve("registry-1.docker.io").is_some());
    }

    #[test]
    fn test_docker_config_missing_file() {
        let dir = TempDir::new().unwrap();
        let keychain = DockerConfigKeychain::new(dir.path().join("missing.json"));
        assert!(keychain.resolve("ghcr.io").is_none());
    }

    #[test]
    fn test_github_keychain_only_ghcr() {
        let keychain = GithubKeychain::with_token("tok");
        assert!(keychain.resolve("ghcr.io").is_some());
        assert!(keychain.resolve("docker.io").is_none());
    }

    #[test]
    fn test_multi_keychain_priority() {
        let explicit = StaticKeychain::new("explicit", "pass1", "ghcr.io/org/app:v1").unwrap();
        let github = GithubKeychain::with_token("tok");
        let chain = MultiKeychain::new(vec![Box::new(explicit), Box::new(github)]);

        // Explicit wins for its own registry.
        assert_eq!(chain.resolve("ghcr.io").unwrap().username, "explicit");
    }

    #[test]
    fn test_multi_keychain_falls_through() {
        let explicit = StaticKeychain::new("explicit", "pass1", "quay.io/org/app:v1").unwrap();
        let github = GithubKeychain::with_token("tok");
        let chain = MultiKeychain::new(vec![Box::new(explicit), Box::new(github)]);

        // Explicit is scoped to quay.io, so ghcr.io falls through to the token.
        assert_eq!(chain.resolve("ghcr.io").unwrap().username, "token");
    }

    #[test]
    fn test_multi_keychain_anonymous_fallback() {
        let chain = MultiKeychain::new(vec![]);
        assert!(matches!(
            chain.resolve_auth("ghcr.io"),
            RegistryAuth::Anonymous
        ));
    }
}
