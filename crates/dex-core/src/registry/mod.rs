//! The registry abstraction: one uniform contract over heterogeneous
//! plugin sources (local directories, git repositories, plain HTTP(S),
//! and object storage), each supporting registry, package, and
//! direct-tarball source shapes.

pub mod azure;
pub mod git;
pub mod http;
pub mod local;
pub mod s3;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::{self, Cache};
use crate::error::{Error, InstallPhase, RegistryOp, Result};
use crate::naming::{filename_from_url, parse_tarball_filename};
use crate::version::{self, Constraint};

pub use azure::AzureRegistry;
pub use git::GitRegistry;
pub use http::HttpRegistry;
pub use local::LocalRegistry;
pub use s3::S3Registry;

/// Timeout for index reads and object-existence probes.
pub(crate) const INDEX_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for bulk transfers (tarball downloads, clones, uploads).
pub(crate) const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// How a source URL should be interpreted. A URL whose path ends in
/// `.tar.gz`/`.tgz` is always a direct tarball, whatever the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceMode {
    /// Probe the source: an index at the root means `Registry`,
    /// otherwise `Package`.
    #[default]
    Auto,
    /// The source is a multi-package index rooted at `registry.json`.
    Registry,
    /// The source is a single package with a manifest at its root.
    Package,
}

/// Lookup result for one package.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub name: String,
    /// Available versions in index order.
    pub versions: Vec<String>,
    pub latest: String,
    pub description: Option<String>,
}

/// A concrete `(name, version, url)` choice produced by resolution and
/// consumed by fetch. Pure value; carries no handles.
#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: String,
    /// Fetch URL in the backend's own grammar.
    pub url: String,
    /// Set by backends that can serve the package from disk directly.
    pub local_path: Option<PathBuf>,
    /// Expected integrity, when the source can state one up front.
    pub integrity: Option<String>,
}

/// Uniform contract implemented by every backend.
#[async_trait]
pub trait Registry: Send + Sync + std::fmt::Debug {
    /// Transport name: `file`, `git`, `https`, `s3`, or `azure`.
    fn protocol(&self) -> &'static str;

    /// Look up a package by name.
    async fn get_package_info(&self, name: &str) -> Result<PackageInfo>;

    /// Choose the best version for a spec and produce its fetch URL.
    async fn resolve(&self, name: &str, spec: &str) -> Result<ResolvedPackage>;

    /// Materialize a resolved package under `dest`, returning the path
    /// to the extracted tree.
    async fn fetch(&self, resolved: &ResolvedPackage, dest: &Path) -> Result<PathBuf>;

    /// Names of all packages the source offers.
    async fn list_packages(&self) -> Result<Vec<String>>;
}

/// Open the registry backend owning `url`'s scheme.
pub async fn open(url: &str, mode: SourceMode, cache: Cache) -> Result<Box<dyn Registry>> {
    if url.starts_with("git+") {
        Ok(Box::new(GitRegistry::connect(url, mode, cache)?))
    } else if url.starts_with("file:") {
        Ok(Box::new(LocalRegistry::connect(url, mode)?))
    } else if url.starts_with("https://") || url.starts_with("http://") {
        Ok(Box::new(HttpRegistry::connect(url, mode, cache)?))
    } else if url.starts_with("s3://") {
        Ok(Box::new(S3Registry::connect(url, mode, cache).await?))
    } else if url.starts_with("az://") {
        Ok(Box::new(AzureRegistry::connect(url, mode, cache)?))
    } else {
        Err(Error::registry_msg(
            url,
            RegistryOp::Connect,
            "unsupported registry scheme",
        ))
    }
}

/// Shared version selection: empty or `latest` trusts the index's
/// `latest` (falling back to insertion order), anything else goes
/// through the constraint algebra over the parseable candidates.
pub(crate) fn select_version(info: &PackageInfo, name: &str, spec: &str) -> Result<String> {
    let trimmed = spec.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("latest") {
        if !info.latest.is_empty() {
            return Ok(info.latest.clone());
        }
        if let Some(last) = info.versions.last() {
            return Ok(last.clone());
        }
        return Err(Error::Version {
            plugin: name.to_string(),
            constraint: "latest".to_string(),
            available: Vec::new(),
            message: None,
        });
    }

    let constraint = Constraint::parse(trimmed).map_err(|e| Error::Version {
        plugin: name.to_string(),
        constraint: trimmed.to_string(),
        available: info.versions.clone(),
        message: Some(e.to_string()),
    })?;

    version::best_match_str(&constraint, &info.versions).ok_or_else(|| Error::Version {
        plugin: name.to_string(),
        constraint: trimmed.to_string(),
        available: info.versions.clone(),
        message: None,
    })
}

/// Single-package info derived from a direct tarball URL's filename.
pub(crate) fn tarball_package_info(url: &str) -> Result<PackageInfo> {
    let filename = filename_from_url(url);
    let info = parse_tarball_filename(&filename).ok_or_else(|| {
        Error::registry_msg(
            url,
            RegistryOp::Parse,
            format!("cannot parse tarball filename {filename:?}"),
        )
    })?;
    Ok(PackageInfo {
        name: info.name,
        versions: vec![info.version.clone()],
        latest: info.version,
        description: None,
    })
}

/// Verify-then-extract tail shared by the downloading backends: a failed
/// verification removes the cache entry; extraction returns the path to
/// the tarball's top-level tree.
pub(crate) fn verify_and_extract(
    plugin: &str,
    cached: &Path,
    integrity: Option<&str>,
    dest: &Path,
) -> Result<PathBuf> {
    if let Some(expected) = integrity {
        cache::verify_or_remove(cached, expected)
            .map_err(|e| Error::install(plugin, InstallPhase::Verify, e))?;
    }
    crate::io::extract::extract_tarball(cached, dest)
        .map_err(|e| Error::install(plugin, InstallPhase::Extract, e))
}
