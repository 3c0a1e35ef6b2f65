//! dex-core - plugin package manager engine.
//!
//! Fetches, verifies, and installs versioned plugin bundles from
//! pluggable registry backends (local directories, git, http(s), S3,
//! Azure Blob), and publishes locally built bundles back to writable
//! backends. The CLI front-end, full manifest schema, and credential
//! acquisition live outside this crate.

pub mod cache;
pub mod error;
pub mod flow;
pub mod index;
pub mod io;
pub mod manifest;
pub mod naming;
pub mod publish;
pub mod registry;
pub mod version;

// Re-exports for convenience
pub use cache::Cache;
pub use error::{Error, Result};
pub use flow::{InstallOutcome, InstallRequest};
pub use io::pack::{PackOptions, PackResult, pack};
pub use manifest::Manifest;
pub use publish::{PublishResult, Publisher};
pub use registry::{PackageInfo, Registry, ResolvedPackage, SourceMode};
pub use version::{Constraint, Version};

use std::path::PathBuf;

use dirs::home_dir;

/// Try to get the dex home directory, `None` when the home directory
/// cannot be determined.
pub fn try_dex_home() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".dex"))
}

/// Default dex home directory: `~/.dex`
///
/// # Panics
/// Panics if the home directory cannot be determined.
pub fn dex_home() -> PathBuf {
    try_dex_home().expect("Could not determine home directory")
}

/// Default cache root: `~/.dex/cache`
pub fn cache_path() -> PathBuf {
    dex_home().join("cache")
}
