//! High-level install and publish flows.
//!
//! Models the install pipeline as explicit steps over the registry
//! contract:
//!
//! ```text
//! source URL --[open]--> Registry --[resolve]--> ResolvedPackage
//!            --[fetch]--> installed tree
//! ```
//!
//! Callers that need finer control (separate resolve/fetch, custom
//! destinations per step) use the [`Registry`](crate::registry::Registry)
//! trait directly; these helpers cover the common whole-pipeline case.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::cache::Cache;
use crate::error::Result;
use crate::publish::{self, PublishResult};
use crate::registry::{self, ResolvedPackage, SourceMode};

/// What to install: a source URL, a plugin name, and a version spec
/// (empty or `latest` for the newest).
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub source: String,
    pub name: String,
    pub spec: String,
    pub mode: SourceMode,
}

impl InstallRequest {
    /// Request the latest version of `name` from `source`.
    pub fn latest(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            spec: "latest".to_string(),
            mode: SourceMode::Auto,
        }
    }

    /// Request a constrained version of `name` from `source`.
    pub fn with_spec(
        source: impl Into<String>,
        name: impl Into<String>,
        spec: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            spec: spec.into(),
            mode: SourceMode::Auto,
        }
    }
}

/// A completed install: where the plugin landed and what was chosen.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub name: String,
    pub version: String,
    /// Path to the installed (extracted or on-disk) tree.
    pub path: PathBuf,
    /// The resolution that produced it.
    pub resolved: ResolvedPackage,
}

/// Resolve and fetch one plugin into `dest`.
pub async fn install(request: &InstallRequest, cache: Cache, dest: &Path) -> Result<InstallOutcome> {
    let source = registry::open(&request.source, request.mode, cache).await?;
    info!(
        source = %request.source,
        protocol = source.protocol(),
        "installing {} {}",
        request.name,
        request.spec
    );

    let resolved = source.resolve(&request.name, &request.spec).await?;
    let path = source.fetch(&resolved, dest).await?;
    info!(path = %path.display(), "installed {} {}", resolved.name, resolved.version);

    Ok(InstallOutcome {
        name: resolved.name.clone(),
        version: resolved.version.clone(),
        path,
        resolved,
    })
}

/// Install a batch of requests into `dest`, one at a time, collecting
/// per-request outcomes. A failed request does not stop the rest; the
/// engine performs no retries of its own.
pub async fn install_all(
    requests: &[InstallRequest],
    cache: &Cache,
    dest: &Path,
) -> Vec<Result<InstallOutcome>> {
    let mut outcomes = Vec::with_capacity(requests.len());
    for request in requests {
        outcomes.push(install(request, cache.clone(), dest).await);
    }
    outcomes
}

/// Publish a tarball to the registry owning `registry_url`'s scheme.
pub async fn publish_to(registry_url: &str, tarball: &Path) -> Result<PublishResult> {
    let publisher = publish::open(registry_url).await?;
    info!(
        registry = registry_url,
        protocol = publisher.protocol(),
        tarball = %tarball.display(),
        "publishing"
    );
    publisher.publish(tarball).await
}
