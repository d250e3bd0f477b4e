//! Shared state threaded through a build.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use inlay_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use crate::cleanup::CleanupRegistry;
use crate::keychain::MultiKeychain;

/// Everything a build needs beyond its spec: cancellation, credentials and
/// temp-file bookkeeping.
pub struct BuildContext {
    cancel: CancellationToken,
    keychain: Arc<MultiKeychain>,
    cleanup: Arc<CleanupRegistry>,
    temp_dir: Option<PathBuf>,
}

impl BuildContext {
    pub fn new(
        cancel: CancellationToken,
        keychain: Arc<MultiKeychain>,
        cleanup: Arc<CleanupRegistry>,
    ) -> Self {
        Self {
            cancel,
            keychain,
            cleanup,
            temp_dir: None,
        }
    }

    /// Place temp files in a specific directory instead of the system default.
    pub fn with_temp_dir(mut self, dir: PathBuf) -> Self {
        self.temp_dir = Some(dir);
        self
    }

    pub fn keychain(&self) -> &MultiKeychain {
        &self.keychain
    }

    pub fn cleanup(&self) -> &Arc<CleanupRegistry> {
        &self.cleanup
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fail fast if cancellation was requested.
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(BuildError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run a future, aborting with `Cancelled` if the token fires first.
    ///
    /// Used around network calls; local filesystem work runs to completion so
    /// that registered temp files stay in a removable state.
    pub async fn run_cancellable<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(BuildError::Cancelled),
            res = fut => res,
        }
    }

    /// Create a named temp file registered for cleanup on exit.
    ///
    /// The file persists past the handle so it can be re-opened for reading;
    /// removal happens through the cleanup registry.
    pub fn create_temp_file(&self, prefix: &str, suffix: &str) -> Result<(std::fs::File, PathBuf)> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).suffix(suffix);
        let named = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let (file, path) = named.keep().map_err(|e| BuildError::Io(e.error))?;
        self.cleanup.register(path.clone());
        Ok((file, path))
    }
}
