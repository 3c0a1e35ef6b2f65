//! S3 backend (`s3://bucket[/prefix]`).
//!
//! Credentials come from the SDK's default provider chain; the client is
//! built once at connect time and shared for the registry's lifetime.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::cache::Cache;
use crate::error::{Error, InstallPhase, RegistryOp, Result};
use crate::index::{REGISTRY_INDEX, RegistryIndex};
use crate::io::download::tmp_sibling;
use crate::naming::{candidate_tarball_names, filename_from_url, is_tarball_url, parse_tarball_filename};
use crate::registry::{
    INDEX_TIMEOUT, PackageInfo, Registry, ResolvedPackage, SourceMode, TRANSFER_TIMEOUT,
    select_version, tarball_package_info, verify_and_extract,
};

/// Split `s3://bucket[/path]` into bucket and path (possibly empty).
pub(crate) fn parse_s3_url(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| Error::registry_msg(url, RegistryOp::Connect, "not an s3:// URL"))?;
    let (bucket, path) = match rest.split_once('/') {
        Some((bucket, path)) => (bucket, path.trim_end_matches('/')),
        None => (rest, ""),
    };
    if bucket.is_empty() {
        return Err(Error::registry_msg(url, RegistryOp::Connect, "missing bucket"));
    }
    Ok((bucket.to_string(), path.to_string()))
}

/// Object key under an optional prefix.
pub(crate) fn prefixed_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

#[derive(Debug)]
pub struct S3Registry {
    url: String,
    bucket: String,
    prefix: String,
    mode: SourceMode,
    cache: Cache,
    client: Client,
    direct_tarball: bool,
}

impl S3Registry {
    /// Open an S3 source with the default credential provider chain.
    pub async fn connect(url: &str, mode: SourceMode, cache: Cache) -> Result<Self> {
        let (bucket, path) = parse_s3_url(url)?;
        let direct_tarball = is_tarball_url(url);
        let prefix = if direct_tarball { String::new() } else { path };

        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let client = Client::new(&config);

        Ok(Self {
            url: url.to_string(),
            bucket,
            prefix,
            mode,
            cache,
            client,
            direct_tarball,
        })
    }

    fn key_from_url(&self, url: &str) -> String {
        url.strip_prefix(&format!("s3://{}/", self.bucket))
            .unwrap_or(url)
            .to_string()
    }

    async fn read_object(&self, key: &str, timeout: std::time::Duration) -> Result<Vec<u8>> {
        let object_url = format!("s3://{}/{key}", self.bucket);
        let request = self.client.get_object().bucket(&self.bucket).key(key).send();
        let output = tokio::time::timeout(timeout, request)
            .await
            .map_err(|e| Error::registry(&object_url, RegistryOp::Fetch, e))?
            .map_err(|e| Error::registry(&object_url, RegistryOp::Fetch, e))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| Error::registry(&object_url, RegistryOp::Fetch, e))?;
        Ok(bytes.to_vec())
    }

    async fn load_index(&self) -> Result<RegistryIndex> {
        let key = prefixed_key(&self.prefix, REGISTRY_INDEX);
        let body = self.read_object(&key, INDEX_TIMEOUT).await?;
        let text = String::from_utf8_lossy(&body);
        let index_url = format!("s3://{}/{key}", self.bucket);
        RegistryIndex::from_json(&text, &index_url)
            .map_err(|e| Error::registry(&index_url, RegistryOp::Parse, e))
    }

    /// HEAD-probe the conventional tarball names; first hit wins, with
    /// the first pattern as the fallback.
    async fn tarball_url(&self, name: &str, version: &str) -> String {
        let candidates = candidate_tarball_names(name, version);
        for candidate in &candidates {
            let key = prefixed_key(&self.prefix, candidate);
            let probe = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send();
            if let Ok(Ok(_)) = tokio::time::timeout(INDEX_TIMEOUT, probe).await {
                debug!(key, "tarball probe hit");
                return format!("s3://{}/{key}", self.bucket);
            }
        }
        format!(
            "s3://{}/{}",
            self.bucket,
            prefixed_key(&self.prefix, &candidates[0])
        )
    }

    /// Stream an object into the cache path via a `.tmp` sibling.
    async fn download_object(&self, key: &str, dest: &Path) -> Result<()> {
        let object_url = format!("s3://{}/{key}", self.bucket);
        let tmp = tmp_sibling(dest);
        let transfer = async {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Error::registry(&object_url, RegistryOp::Fetch, e))?;
            let mut body = output.body;
            let mut file = tokio::fs::File::create(&tmp)
                .await
                .map_err(|e| Error::registry(&object_url, RegistryOp::Fetch, e))?;
            while let Some(chunk) = body
                .try_next()
                .await
                .map_err(|e| Error::registry(&object_url, RegistryOp::Fetch, e))?
            {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| Error::registry(&object_url, RegistryOp::Fetch, e))?;
            }
            file.flush()
                .await
                .map_err(|e| Error::registry(&object_url, RegistryOp::Fetch, e))?;
            Ok(())
        };

        let result = match tokio::time::timeout(TRANSFER_TIMEOUT, transfer).await {
            Ok(inner) => inner,
            Err(e) => Err(Error::registry(&object_url, RegistryOp::Fetch, e)),
        };
        match result {
            Ok(()) => {
                tokio::fs::rename(&tmp, dest)
                    .await
                    .map_err(|e| Error::registry(&object_url, RegistryOp::Fetch, e))?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    fn unsupported_package_mode(&self) -> Error {
        Error::registry_msg(
            &self.url,
            RegistryOp::Fetch,
            "package mode is not supported for s3 sources; use a registry prefix or a direct tarball URL",
        )
    }
}

#[async_trait]
impl Registry for S3Registry {
    fn protocol(&self) -> &'static str {
        "s3"
    }

    async fn get_package_info(&self, name: &str) -> Result<PackageInfo> {
        if self.direct_tarball {
            return tarball_package_info(&self.url);
        }
        if self.mode == SourceMode::Package {
            return Err(self.unsupported_package_mode());
        }
        let index = self.load_index().await?;
        let (key, entry) = index
            .find(name)
            .ok_or_else(|| Error::package_not_found(name))?;
        Ok(PackageInfo {
            name: key.to_string(),
            versions: entry.versions.clone(),
            latest: entry.latest.clone(),
            description: None,
        })
    }

    async fn resolve(&self, name: &str, spec: &str) -> Result<ResolvedPackage> {
        if self.direct_tarball {
            let info = tarball_package_info(&self.url)?;
            return Ok(ResolvedPackage {
                name: info.name,
                version: info.latest,
                url: self.url.clone(),
                local_path: None,
                integrity: None,
            });
        }

        let info = self.get_package_info(name).await?;
        let version = select_version(&info, name, spec)?;
        let url = self.tarball_url(&info.name, &version).await;
        Ok(ResolvedPackage {
            name: info.name,
            version,
            url,
            local_path: None,
            integrity: None,
        })
    }

    async fn fetch(&self, resolved: &ResolvedPackage, dest: &Path) -> Result<PathBuf> {
        let cache_key = Cache::url_key("s3", &resolved.url);
        let cached = self.cache.path_for(&cache_key);

        if self.cache.has(&cache_key) {
            debug!(cache_key, "cache hit");
        } else {
            self.cache
                .ensure_dir("s3")
                .map_err(|e| Error::install(&resolved.name, InstallPhase::Fetch, e))?;
            let object_key = self.key_from_url(&resolved.url);
            self.download_object(&object_key, &cached).await?;
        }

        verify_and_extract(&resolved.name, &cached, resolved.integrity.as_deref(), dest)
    }

    async fn list_packages(&self) -> Result<Vec<String>> {
        if self.direct_tarball {
            let filename = filename_from_url(&self.url);
            return Ok(parse_tarball_filename(&filename)
                .map(|t| vec![t.name])
                .unwrap_or_default());
        }
        if self.mode == SourceMode::Package {
            return Err(self.unsupported_package_mode());
        }
        Ok(self.load_index().await?.package_names())
    }
}
