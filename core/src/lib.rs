//! Inlay Core - Foundational Types
//!
//! Error taxonomy and result alias shared by the build pipeline and the CLI.

pub mod error;

// Re-export commonly used types
pub use error::{BuildError, Result};

/// Inlay version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
