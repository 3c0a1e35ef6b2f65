//! HTTPS publisher: plain HTTP(S) registries have no upload protocol, so
//! publishing produces the manual steps instead of performing any I/O.

use std::path::Path;

use async_trait::async_trait;

use crate::error::{Error, PublishPhase, Result};
use crate::index::REGISTRY_INDEX;
use crate::publish::{PublishResult, Publisher, tarball_integrity, validate_tarball};

#[derive(Debug)]
pub struct HttpsPublisher {
    base_url: String,
}

impl HttpsPublisher {
    pub fn connect(registry_url: &str) -> Result<Self> {
        if !registry_url.starts_with("https://") && !registry_url.starts_with("http://") {
            return Err(Error::Publish {
                plugin: None,
                url: registry_url.to_string(),
                phase: PublishPhase::Connect,
                cause: Some("not an http(s) URL".into()),
            });
        }
        Ok(Self {
            base_url: registry_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Publisher for HttpsPublisher {
    fn protocol(&self) -> &'static str {
        "https"
    }

    async fn publish(&self, tarball: &Path) -> Result<PublishResult> {
        let info = validate_tarball(tarball, &self.base_url)?;
        let integrity = tarball_integrity(tarball, &self.base_url, &info.name)?;

        let filename = tarball
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let url = format!("{}/{filename}", self.base_url);

        let instructions = format!(
            "Publishing over plain http(s) requires manual steps:\n\
             1. Upload {filename} to {url}\n\
             2. Update {base}/{REGISTRY_INDEX}: append \"{version}\" to the \
             versions of \"{name}\" (create the entry if missing) and set its \
             latest to \"{version}\"\n\
             3. Record the integrity {integrity}",
            base = self.base_url,
            name = info.name,
            version = info.version,
        );

        Ok(PublishResult {
            name: info.name,
            version: info.version,
            url,
            integrity,
            manual_instructions: Some(instructions),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_publish_returns_instructions_without_io() {
        let dir = tempdir().unwrap();
        let tarball = dir.path().join("p-1.2.0.tar.gz");
        std::fs::write(&tarball, b"bytes").unwrap();

        let publisher = HttpsPublisher::connect("https://plugins.example.com/registry/").unwrap();
        let result = publisher.publish(&tarball).await.unwrap();

        assert_eq!(result.name, "p");
        assert_eq!(result.version, "1.2.0");
        assert_eq!(
            result.url,
            "https://plugins.example.com/registry/p-1.2.0.tar.gz"
        );
        let instructions = result.manual_instructions.unwrap();
        assert!(instructions.contains("registry.json"));
        assert!(instructions.contains("p-1.2.0.tar.gz"));
        assert!(instructions.contains(&result.integrity));
    }

    #[test]
    fn test_connect_rejects_other_schemes() {
        assert!(HttpsPublisher::connect("s3://bucket").is_err());
    }
}
