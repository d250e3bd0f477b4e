use thiserror::Error;

/// Inlay error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// Malformed image reference
    #[error("invalid image reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// Network, auth, or not-found failure while talking to a registry
    #[error("registry fetch failed: {registry} - {message}")]
    RegistryFetch { registry: String, message: String },

    /// The base image index carries no manifest for the requested platform
    #[error("no manifest for platform {platform} in {reference}")]
    PlatformNotFound { platform: String, reference: String },

    /// Source tree entry that cannot be packaged reproducibly
    #[error("unsupported entry in source tree: {0}")]
    UnsupportedEntry(String),

    /// Base image uses a manifest format we cannot derive a layer type from
    #[error("unsupported base image media type: {0}")]
    UnsupportedMediaType(String),

    /// Base image config blob could not be decoded
    #[error("failed to read image config: {0}")]
    ConfigRead(String),

    /// Layer could not be appended to the base image
    #[error("failed to append layer: {0}")]
    LayerAppend(String),

    /// Remote registry write failure
    #[error("remote publish failed: {registry} - {message}")]
    RemotePublish { registry: String, message: String },

    /// Local container daemon write failure
    #[error("daemon publish failed: {0}")]
    DaemonPublish(String),

    /// Local archive write failure
    #[error("file write failed: {path} - {message}")]
    FileWrite { path: String, message: String },

    /// The build was cancelled before it completed
    #[error("build cancelled")]
    Cancelled,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Pipeline stage attribution wrapper
    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<BuildError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BuildError {
    /// Wrap this error with the name of the pipeline stage that produced it.
    pub fn in_stage(self, stage: &'static str) -> Self {
        BuildError::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// True if this error (or the stage-wrapped error inside it) is `Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        match self {
            BuildError::Cancelled => true,
            BuildError::Stage { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

/// Result type alias for inlay operations
pub type Result<T> = std::result::Result<T, BuildError>;
