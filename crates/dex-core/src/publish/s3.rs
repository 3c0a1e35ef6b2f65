//! S3 publisher: upload the tarball, then download-modify-upload the
//! shared index.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;

use crate::error::{Error, PublishPhase, Result};
use crate::index::{REGISTRY_INDEX, RegistryIndex, update_index};
use crate::publish::{PublishResult, Publisher, tarball_integrity, validate_tarball};
use crate::registry::s3::{parse_s3_url, prefixed_key};
use crate::registry::{INDEX_TIMEOUT, TRANSFER_TIMEOUT};

#[derive(Debug)]
pub struct S3Publisher {
    url: String,
    bucket: String,
    prefix: String,
    client: Client,
}

impl S3Publisher {
    /// Open an S3 registry for publishing, with the default credential
    /// provider chain.
    pub async fn connect(registry_url: &str) -> Result<Self> {
        let (bucket, prefix) = parse_s3_url(registry_url).map_err(|e| Error::Publish {
            plugin: None,
            url: registry_url.to_string(),
            phase: PublishPhase::Connect,
            cause: Some(Box::new(e)),
        })?;
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Ok(Self {
            url: registry_url.to_string(),
            bucket,
            prefix,
            client: Client::new(&config),
        })
    }

    async fn upload(&self, key: &str, body: ByteStream, content_type: &str, plugin: &str) -> Result<()> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send();
        tokio::time::timeout(TRANSFER_TIMEOUT, request)
            .await
            .map_err(|e| {
                Error::publish(Some(plugin.to_string()), &self.url, PublishPhase::Upload, e)
            })?
            .map_err(|e| {
                Error::publish(Some(plugin.to_string()), &self.url, PublishPhase::Upload, e)
            })?;
        Ok(())
    }

    /// Download the current index; an absent object is an empty registry.
    async fn load_index(&self, plugin: &str) -> Result<Option<RegistryIndex>> {
        let key = prefixed_key(&self.prefix, REGISTRY_INDEX);
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send();
        let output = match tokio::time::timeout(INDEX_TIMEOUT, request).await {
            Err(e) => {
                return Err(Error::publish(
                    Some(plugin.to_string()),
                    &self.url,
                    PublishPhase::Index,
                    e,
                ));
            }
            Ok(Err(e)) => {
                let absent = e
                    .as_service_error()
                    .map(|service| service.is_no_such_key())
                    .unwrap_or(false);
                if absent {
                    return Ok(None);
                }
                return Err(Error::publish(
                    Some(plugin.to_string()),
                    &self.url,
                    PublishPhase::Index,
                    e,
                ));
            }
            Ok(Ok(output)) => output,
        };

        let bytes = output.body.collect().await.map_err(|e| {
            Error::publish(Some(plugin.to_string()), &self.url, PublishPhase::Index, e)
        })?;
        let text = String::from_utf8_lossy(&bytes.to_vec()).into_owned();
        let index_url = format!("s3://{}/{key}", self.bucket);
        RegistryIndex::from_json(&text, &index_url)
            .map(Some)
            .map_err(|e| {
                Error::publish(Some(plugin.to_string()), &self.url, PublishPhase::Index, e)
            })
    }
}

#[async_trait]
impl Publisher for S3Publisher {
    fn protocol(&self) -> &'static str {
        "s3"
    }

    async fn publish(&self, tarball: &Path) -> Result<PublishResult> {
        let info = validate_tarball(tarball, &self.url)?;
        let integrity = tarball_integrity(tarball, &self.url, &info.name)?;

        let filename = tarball
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = prefixed_key(&self.prefix, &filename);

        let body = ByteStream::from_path(tarball).await.map_err(|e| {
            Error::publish(Some(info.name.clone()), &self.url, PublishPhase::Upload, e)
        })?;
        self.upload(&key, body, "application/gzip", &info.name).await?;
        debug!(key, "uploaded tarball");

        let index = update_index(self.load_index(&info.name).await?, &info.name, &info.version);
        let index_key = prefixed_key(&self.prefix, REGISTRY_INDEX);
        self.upload(
            &index_key,
            ByteStream::from(index.to_json_pretty().into_bytes()),
            "application/json",
            &info.name,
        )
        .await?;

        Ok(PublishResult {
            name: info.name,
            version: info.version,
            url: format!("s3://{}/{key}", self.bucket),
            integrity,
            manual_instructions: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_parses_registry_url() {
        let publisher = S3Publisher::connect("s3://bucket/plugins").await.unwrap();
        assert_eq!(publisher.protocol(), "s3");
        assert_eq!(publisher.bucket, "bucket");
        assert_eq!(publisher.prefix, "plugins");
    }

    #[tokio::test]
    async fn test_connect_rejects_non_s3() {
        assert!(S3Publisher::connect("file:/tmp/r").await.is_err());
    }

    #[test]
    fn test_publish_url_shape() {
        assert_eq!(
            format!("s3://{}/{}", "b", prefixed_key("plugins", "p-1.0.0.tar.gz")),
            "s3://b/plugins/p-1.0.0.tar.gz"
        );
    }
}
