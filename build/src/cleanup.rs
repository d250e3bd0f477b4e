//! Process-wide cleanup registry for build temp files.
//!
//! The intermediate tar and blob files created during a build outlive the
//! functions that create them; only the top-level caller knows when the build
//! is done or abandoned. Ownership of those paths is therefore centralized
//! here: steps register paths, and the registry removes them all on normal
//! completion or on SIGINT/SIGTERM, whichever comes first.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

struct Inner {
    paths: Vec<PathBuf>,
    closed: bool,
}

/// Registry of temp paths removed at process exit or on a termination signal.
pub struct CleanupRegistry {
    inner: Mutex<Inner>,
}

impl CleanupRegistry {
    /// Create a registry and start its signal watcher.
    ///
    /// Must be called from within a tokio runtime; the watcher task drains
    /// the registry when SIGINT or SIGTERM arrives.
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Self {
            inner: Mutex::new(Inner {
                paths: Vec::new(),
                closed: false,
            }),
        });
        registry.watch_signals();
        registry
    }

    fn watch_signals(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            wait_for_termination().await;
            if let Some(registry) = weak.upgrade() {
                registry.close();
            }
        });
    }

    /// Record a path for removal when the registry closes.
    ///
    /// A path registered after the registry has already closed (a signal can
    /// drain it while local build steps are still running) is removed on the
    /// spot instead of being left behind.
    pub fn register(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        {
            let mut inner = self.inner.lock();
            if !inner.closed {
                inner.paths.push(path);
                return;
            }
        }
        remove_path(&path);
    }

    /// Remove every registered path and clear the registry.
    ///
    /// Removal is best-effort: a failure for one path is logged and does not
    /// stop removal of the others. Safe to call more than once; the drain
    /// runs only the first time.
    pub fn close(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            std::mem::take(&mut inner.paths)
        };

        for path in drained {
            remove_path(&path);
        }
    }

    /// True once `close()` has drained the registry.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Best-effort removal; a missing path is fine, anything else is logged.
fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove temp path");
        }
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_close_removes_registered_paths() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("layer.tar");
        fs::write(&file, "data").unwrap();

        let registry = CleanupRegistry::new();
        registry.register(&file);
        registry.close();

        assert!(!file.exists());
        assert!(registry.is_closed());
    }

    #[tokio::test]
    async fn test_close_removes_directories() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("work");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("f"), "data").unwrap();

        let registry = CleanupRegistry::new();
        registry.register(&sub);
        registry.close();

        assert!(!sub.exists());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("layer.tar");
        fs::write(&file, "data").unwrap();

        let registry = CleanupRegistry::new();
        registry.register(&file);
        registry.close();
        registry.close();

        assert!(!file.exists());
        assert!(registry.is_closed());
    }

    #[tokio::test]
    async fn test_register_after_close_removes_immediately() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("late.tar");

        let registry = CleanupRegistry::new();
        registry.close();

        fs::write(&file, "data").unwrap();
        registry.register(&file);

        assert!(!file.exists());
        assert!(registry.is_closed());
    }

    #[tokio::test]
    async fn test_missing_path_does_not_abort_drain() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("already-gone");
        let file = dir.path().join("layer.tar");
        fs::write(&file, "data").unwrap();

        let registry = CleanupRegistry::new();
        registry.register(&missing);
        registry.register(&file);
        registry.close();

        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_concurrent_close_drains_once() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("layer.tar");
        fs::write(&file, "data").unwrap();

        let registry = CleanupRegistry::new();
        registry.register(&file);

        // Race a watcher-style close against the normal-completion close.
        let r1 = registry.clone();
        let r2 = registry.clone();
        let a = tokio::spawn(async move { r1.close() });
        let b = tokio::spawn(async move { r2.close() });
        a.await.unwrap();
        b.await.unwrap();

        assert!(!file.exists());
        assert!(registry.is_closed());
    }
}
