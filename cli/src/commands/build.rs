//! `inlay build` command.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;

use inlay_build::keychain::{
    DockerConfigKeychain, GithubKeychain, Keychain, MultiKeychain, StaticKeychain,
};
use inlay_build::spec::{BuildSpec, InjectLayer, Platform, Target, TargetType};
use inlay_build::{BuildContext, CleanupRegistry};

use crate::git;

#[derive(Args)]
pub struct BuildArgs {
    /// Directory to inject into the image
    pub source: PathBuf,

    /// Base image reference, or "scratch" for an empty base
    #[arg(short, long, env = "INLAY_BASE_REF", default_value = "ubuntu:jammy")]
    pub base_ref: String,

    /// Platform to select from the base image index (e.g., "linux/arm64")
    #[arg(long, env = "INLAY_PLATFORM", default_value = "linux/amd64")]
    pub platform: Platform,

    /// Path the source directory lands at inside the image
    #[arg(long, env = "INLAY_DESTINATION_PATH", default_value = "/inlay-app")]
    pub destination_path: String,

    /// Force root ownership on injected entries
    #[arg(
        long,
        env = "INLAY_DESTINATION_CHOWN",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub destination_chown: bool,

    /// Entrypoint binary inside the image
    #[arg(short, long, env = "INLAY_ENTRYPOINT", default_value = "/inlay-app/app")]
    pub entrypoint: String,

    /// Where to publish: repo reference, or output path for LOCAL_FILE
    #[arg(short = 'r', long, env = "INLAY_TARGET_REPO")]
    pub target_repo: String,

    /// Publish transport
    #[arg(short = 't', long, env = "INLAY_TARGET_TYPE", default_value = "REMOTE")]
    pub target_type: TargetType,

    /// Image author
    #[arg(
        long,
        env = "INLAY_AUTHOR",
        default_value = "github.com/inlay-build/inlay"
    )]
    pub author: String,

    /// Label to set on the image, as key=value (repeatable)
    #[arg(short = 'a', long = "annotation", env = "INLAY_ANNOTATIONS", value_delimiter = ',')]
    pub annotations: Vec<String>,

    /// Label applied before explicit annotations, as key=value (repeatable)
    #[arg(long = "default-annotation", env = "INLAY_DEFAULT_ANNOTATIONS", value_delimiter = ',')]
    pub default_annotations: Vec<String>,

    /// Derive version annotations automatically: "git" or "none"
    #[arg(long, env = "INLAY_AUTO_VERSION_ANNOTATION", default_value = "none")]
    pub auto_version_annotation: String,

    /// Environment variable to append, as key=value (repeatable)
    #[arg(long = "env", env = "INLAY_ENV", value_delimiter = ',')]
    pub env_vars: Vec<String>,

    /// Registry username for the target repo
    #[arg(long, env = "INLAY_REGISTRY_USER")]
    pub registry_user: Option<String>,

    /// Registry password for the target repo
    #[arg(long, env = "INLAY_REGISTRY_PASS", hide_env_values = true)]
    pub registry_pass: Option<String>,

    /// Directory for scratch files instead of the system temp dir
    #[arg(long, env = "INLAY_TMP")]
    pub tmp: Option<PathBuf>,
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let annotations = collect_annotations(&args)?;
    let env = parse_pairs(&args.env_vars)?;

    let spec = BuildSpec {
        base_ref: args.base_ref.clone(),
        inject: InjectLayer {
            platform: args.platform.clone(),
            source_path: args.source.clone(),
            destination_path: args.destination_path.clone(),
            destination_chown: args.destination_chown,
            entrypoint: args.entrypoint.clone(),
        },
        target: Target {
            repo: args.target_repo.clone(),
            target_type: args.target_type,
        },
        author: args.author.clone(),
        annotations,
        env,
    };

    tracing::debug!("build spec:\n{}", serde_yaml::to_string(&spec)?);

    let mut chain: Vec<Box<dyn Keychain>> = Vec::new();
    if let (Some(user), Some(pass)) = (&args.registry_user, &args.registry_pass) {
        chain.push(Box::new(StaticKeychain::new(user, pass, &args.target_repo)?));
    }
    chain.push(Box::new(DockerConfigKeychain::default_path()));
    chain.push(Box::new(GithubKeychain::from_env()));

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping build");
            signal_cancel.cancel();
        }
    });

    let cleanup = CleanupRegistry::new();
    let mut ctx = BuildContext::new(cancel, Arc::new(MultiKeychain::new(chain)), cleanup.clone());
    if let Some(tmp) = &args.tmp {
        ctx = ctx.with_temp_dir(tmp.clone());
    }

    let result = inlay_build::run(&ctx, &spec).await;
    cleanup.close();

    let produced = result?;
    println!("{produced}");
    Ok(())
}

/// Merge annotation sources: git-derived first, then defaults, then explicit
/// annotations. Later sources overwrite earlier ones key by key.
fn collect_annotations(args: &BuildArgs) -> Result<BTreeMap<String, String>, Box<dyn std::error::Error>> {
    let mut annotations = BTreeMap::new();

    match args.auto_version_annotation.as_str() {
        "git" => {
            let info = git::collect(&args.source).ok_or_else(|| {
                format!(
                    "failed to get git info for {}",
                    args.source.display()
                )
            })?;
            tracing::debug!(commit = %info.commit, dirty = info.dirty, "found git info");
            annotations.extend(git::version_annotations(&info)?);
        }
        "none" => {}
        other => {
            return Err(format!("unknown auto-version-annotation mode '{other}'").into());
        }
    }

    annotations.extend(parse_pairs(&args.default_annotations)?);
    annotations.extend(parse_pairs(&args.annotations)?);
    Ok(annotations)
}

/// Parse repeated `key=value` strings into a map.
fn parse_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>, Box<dyn std::error::Error>> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{pair}'"))?;
        if key.is_empty() {
            return Err(format!("empty key in '{pair}'").into());
        }
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}
