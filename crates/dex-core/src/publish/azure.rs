//! Azure Blob publisher over an opendal azblob operator.

use std::path::Path;

use async_trait::async_trait;
use opendal::services::Azblob;
use opendal::{ErrorKind, Operator};
use tracing::debug;

use crate::error::{Error, PublishPhase, Result};
use crate::index::{REGISTRY_INDEX, RegistryIndex, update_index};
use crate::publish::{PublishResult, Publisher, tarball_integrity, validate_tarball};
use crate::registry::azure::parse_azure_url;
use crate::registry::s3::prefixed_key;
use crate::registry::{INDEX_TIMEOUT, TRANSFER_TIMEOUT};

#[derive(Debug)]
pub struct AzurePublisher {
    url: String,
    account: String,
    container: String,
    prefix: String,
    op: Operator,
}

impl AzurePublisher {
    /// Open an Azure Blob registry for publishing. Credentials come from
    /// `AZURE_STORAGE_ACCOUNT_KEY` when set.
    pub fn connect(registry_url: &str) -> Result<Self> {
        let (account, container, prefix) =
            parse_azure_url(registry_url).map_err(|e| Error::Publish {
                plugin: None,
                url: registry_url.to_string(),
                phase: PublishPhase::Connect,
                cause: Some(Box::new(e)),
            })?;

        let mut builder = Azblob::default();
        builder.container(&container);
        builder.account_name(&account);
        builder.endpoint(&format!("https://{account}.blob.core.windows.net"));
        if let Ok(key) = std::env::var("AZURE_STORAGE_ACCOUNT_KEY") {
            builder.account_key(&key);
        }
        let op = Operator::new(builder)
            .map_err(|e| Error::publish(None, registry_url, PublishPhase::Connect, e))?
            .finish();

        Ok(Self {
            url: registry_url.to_string(),
            account,
            container,
            prefix,
            op,
        })
    }

    fn blob_url(&self, blob: &str) -> String {
        format!("az://{}/{}/{blob}", self.account, self.container)
    }

    async fn write_blob(
        &self,
        blob: &str,
        bytes: Vec<u8>,
        timeout: std::time::Duration,
        plugin: &str,
        phase: PublishPhase,
    ) -> Result<()> {
        let write = self.op.write(blob, bytes);
        tokio::time::timeout(timeout, write)
            .await
            .map_err(|e| Error::publish(Some(plugin.to_string()), &self.url, phase, e))?
            .map_err(|e| Error::publish(Some(plugin.to_string()), &self.url, phase, e))?;
        Ok(())
    }

    /// Download the current index; an absent blob is an empty registry.
    async fn load_index(&self, plugin: &str) -> Result<Option<RegistryIndex>> {
        let blob = prefixed_key(&self.prefix, REGISTRY_INDEX);
        let read = self.op.read(&blob);
        let body = match tokio::time::timeout(INDEX_TIMEOUT, read).await {
            Err(e) => {
                return Err(Error::publish(
                    Some(plugin.to_string()),
                    &self.url,
                    PublishPhase::Index,
                    e,
                ));
            }
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Ok(Err(e)) => {
                return Err(Error::publish(
                    Some(plugin.to_string()),
                    &self.url,
                    PublishPhase::Index,
                    e,
                ));
            }
            Ok(Ok(body)) => body,
        };

        let text = String::from_utf8_lossy(&body);
        RegistryIndex::from_json(&text, &self.blob_url(&blob))
            .map(Some)
            .map_err(|e| {
                Error::publish(Some(plugin.to_string()), &self.url, PublishPhase::Index, e)
            })
    }
}

#[async_trait]
impl Publisher for AzurePublisher {
    fn protocol(&self) -> &'static str {
        "azure"
    }

    async fn publish(&self, tarball: &Path) -> Result<PublishResult> {
        let info = validate_tarball(tarball, &self.url)?;
        let integrity = tarball_integrity(tarball, &self.url, &info.name)?;

        let filename = tarball
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let blob = prefixed_key(&self.prefix, &filename);

        let bytes = tokio::fs::read(tarball).await.map_err(|e| {
            Error::publish(Some(info.name.clone()), &self.url, PublishPhase::Upload, e)
        })?;
        self.write_blob(&blob, bytes, TRANSFER_TIMEOUT, &info.name, PublishPhase::Upload)
            .await?;
        debug!(blob, "uploaded tarball");

        let index = update_index(self.load_index(&info.name).await?, &info.name, &info.version);
        let index_blob = prefixed_key(&self.prefix, REGISTRY_INDEX);
        self.write_blob(
            &index_blob,
            index.to_json_pretty().into_bytes(),
            INDEX_TIMEOUT,
            &info.name,
            PublishPhase::Index,
        )
        .await?;

        Ok(PublishResult {
            name: info.name,
            version: info.version,
            url: self.blob_url(&blob),
            integrity,
            manual_instructions: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_parses_registry_url() {
        let publisher = AzurePublisher::connect("az://acct/container/stable").unwrap();
        assert_eq!(publisher.protocol(), "azure");
        assert_eq!(publisher.account, "acct");
        assert_eq!(publisher.container, "container");
        assert_eq!(publisher.prefix, "stable");
    }

    #[test]
    fn test_connect_rejects_malformed_url() {
        assert!(AzurePublisher::connect("az://only-account").is_err());
        assert!(AzurePublisher::connect("s3://bucket").is_err());
    }

    #[test]
    fn test_publish_url_shape() {
        let publisher = AzurePublisher::connect("az://acct/container").unwrap();
        assert_eq!(
            publisher.blob_url("p-1.0.0.tar.gz"),
            "az://acct/container/p-1.0.0.tar.gz"
        );
    }
}
