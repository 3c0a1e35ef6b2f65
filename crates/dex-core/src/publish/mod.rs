//! The write-side dual of the registry abstraction: upload a locally
//! built tarball and fold its version into the shared `registry.json`.
//!
//! The index update is read-modify-write with no compare-and-set, so
//! concurrent publishers against one registry can lose updates; callers
//! that need serialization must arrange it externally.

pub mod azure;
pub mod http;
pub mod local;
pub mod s3;

use std::path::Path;

use async_trait::async_trait;

use crate::cache;
use crate::error::{Error, PublishPhase, Result};
use crate::naming::{TarballInfo, parse_tarball_filename};

pub use azure::AzurePublisher;
pub use http::HttpsPublisher;
pub use local::LocalPublisher;
pub use s3::S3Publisher;

/// What a publish run produced.
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub name: String,
    pub version: String,
    /// Where the tarball now lives, in the backend's URL grammar.
    pub url: String,
    /// `sha256-<lowercase-hex>` of the tarball contents.
    pub integrity: String,
    /// Set by backends that cannot upload (plain HTTPS): the steps the
    /// operator has to perform by hand.
    pub manual_instructions: Option<String>,
}

/// Uniform contract implemented by every publish backend.
#[async_trait]
pub trait Publisher: Send + Sync + std::fmt::Debug {
    /// Transport name: `file`, `https`, `s3`, or `azure`.
    fn protocol(&self) -> &'static str;

    /// Publish a tarball, updating the registry index where the backend
    /// supports writes.
    async fn publish(&self, tarball: &Path) -> Result<PublishResult>;
}

/// Open the publish backend owning `registry_url`'s scheme.
pub async fn open(registry_url: &str) -> Result<Box<dyn Publisher>> {
    if registry_url.starts_with("file:") {
        Ok(Box::new(LocalPublisher::connect(registry_url)?))
    } else if registry_url.starts_with("s3://") {
        Ok(Box::new(S3Publisher::connect(registry_url).await?))
    } else if registry_url.starts_with("az://") {
        Ok(Box::new(AzurePublisher::connect(registry_url)?))
    } else if registry_url.starts_with("https://") || registry_url.starts_with("http://") {
        Ok(Box::new(HttpsPublisher::connect(registry_url)?))
    } else {
        Err(Error::Publish {
            plugin: None,
            url: registry_url.to_string(),
            phase: PublishPhase::Connect,
            cause: Some("unsupported registry scheme".into()),
        })
    }
}

/// Step one of every publish: the tarball must exist and its filename
/// must carry a parseable `{name}-{version}` pair.
pub(crate) fn validate_tarball(tarball: &Path, registry_url: &str) -> Result<TarballInfo> {
    let filename = tarball
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let info = parse_tarball_filename(&filename).ok_or_else(|| Error::Publish {
        plugin: None,
        url: registry_url.to_string(),
        phase: PublishPhase::Validate,
        cause: Some(format!("cannot parse tarball filename {filename:?}").into()),
    })?;
    if !tarball.is_file() {
        return Err(Error::Publish {
            plugin: Some(info.name.clone()),
            url: registry_url.to_string(),
            phase: PublishPhase::Validate,
            cause: Some(format!("{} is not a file", tarball.display()).into()),
        });
    }
    Ok(info)
}

/// Step two: the tarball's content integrity in publisher format.
pub(crate) fn tarball_integrity(
    tarball: &Path,
    registry_url: &str,
    plugin: &str,
) -> Result<String> {
    cache::file_integrity_hex(tarball).map_err(|e| {
        Error::publish(
            Some(plugin.to_string()),
            registry_url,
            PublishPhase::Validate,
            e,
        )
    })
}
