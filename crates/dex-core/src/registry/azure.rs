//! Azure Blob backend (`az://account/container[/prefix]`) over an
//! opendal azblob operator.
//!
//! Credentials are delegated to the environment: an account key in
//! `AZURE_STORAGE_ACCOUNT_KEY` when present, anonymous access otherwise.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use opendal::services::Azblob;
use opendal::{ErrorKind, Operator};
use tracing::debug;

use crate::cache::Cache;
use crate::error::{Error, InstallPhase, RegistryOp, Result};
use crate::index::{REGISTRY_INDEX, RegistryIndex};
use crate::io::download::tmp_sibling;
use crate::manifest::{MANIFEST_JSON, Manifest};
use crate::naming::{candidate_tarball_names, filename_from_url, is_tarball_url, names_match, parse_tarball_filename};
use crate::registry::{
    INDEX_TIMEOUT, PackageInfo, Registry, ResolvedPackage, SourceMode, TRANSFER_TIMEOUT,
    select_version, tarball_package_info, verify_and_extract,
};
use crate::registry::s3::prefixed_key;

/// Split `az://account/container[/path]` into its three parts.
pub(crate) fn parse_azure_url(url: &str) -> Result<(String, String, String)> {
    let rest = url
        .strip_prefix("az://")
        .ok_or_else(|| Error::registry_msg(url, RegistryOp::Connect, "not an az:// URL"))?;
    let mut parts = rest.splitn(3, '/');
    let account = parts.next().unwrap_or_default();
    let container = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default().trim_end_matches('/');
    if account.is_empty() || container.is_empty() {
        return Err(Error::registry_msg(
            url,
            RegistryOp::Connect,
            "expected az://account/container[/prefix]",
        ));
    }
    Ok((account.to_string(), container.to_string(), path.to_string()))
}

#[derive(Debug)]
pub struct AzureRegistry {
    url: String,
    account: String,
    container: String,
    prefix: String,
    mode: SourceMode,
    cache: Cache,
    op: Operator,
    direct_tarball: bool,
}

impl AzureRegistry {
    /// Open an Azure Blob source.
    pub fn connect(url: &str, mode: SourceMode, cache: Cache) -> Result<Self> {
        let (account, container, path) = parse_azure_url(url)?;
        let direct_tarball = is_tarball_url(url);
        let prefix = if direct_tarball { String::new() } else { path };

        let mut builder = Azblob::default();
        builder.container(&container);
        builder.account_name(&account);
        builder.endpoint(&format!("https://{account}.blob.core.windows.net"));
        if let Ok(key) = std::env::var("AZURE_STORAGE_ACCOUNT_KEY") {
            builder.account_key(&key);
        }
        let op = Operator::new(builder)
            .map_err(|e| Error::registry(url, RegistryOp::Connect, e))?
            .finish();

        Ok(Self {
            url: url.to_string(),
            account,
            container,
            prefix,
            mode,
            cache,
            op,
            direct_tarball,
        })
    }

    fn blob_url(&self, blob: &str) -> String {
        format!("az://{}/{}/{blob}", self.account, self.container)
    }

    fn blob_from_url(&self, url: &str) -> String {
        url.strip_prefix(&format!("az://{}/{}/", self.account, self.container))
            .unwrap_or(url)
            .to_string()
    }

    async fn read_blob(&self, blob: &str, timeout: std::time::Duration) -> Result<Vec<u8>> {
        let url = self.blob_url(blob);
        let read = self.op.read(blob);
        tokio::time::timeout(timeout, read)
            .await
            .map_err(|e| Error::registry(&url, RegistryOp::Fetch, e))?
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    Error::NotFound {
                        kind: "blob".to_string(),
                        name: url.clone(),
                    }
                } else {
                    Error::registry(&url, RegistryOp::Fetch, e)
                }
            })
    }

    async fn load_index(&self) -> Result<RegistryIndex> {
        let blob = prefixed_key(&self.prefix, REGISTRY_INDEX);
        let body = self.read_blob(&blob, INDEX_TIMEOUT).await?;
        let text = String::from_utf8_lossy(&body);
        let index_url = self.blob_url(&blob);
        RegistryIndex::from_json(&text, &index_url)
            .map_err(|e| Error::registry(&index_url, RegistryOp::Parse, e))
    }

    async fn load_manifest(&self) -> Result<Manifest> {
        let blob = prefixed_key(&self.prefix, MANIFEST_JSON);
        let body = self.read_blob(&blob, INDEX_TIMEOUT).await?;
        Manifest::from_json(&String::from_utf8_lossy(&body), &self.blob_url(&blob))
    }

    /// Probe the conventional tarball names with blob-properties calls.
    async fn tarball_url(&self, name: &str, version: &str) -> String {
        let candidates = candidate_tarball_names(name, version);
        for candidate in &candidates {
            let blob = prefixed_key(&self.prefix, candidate);
            let probe = self.op.stat(&blob);
            if let Ok(Ok(_)) = tokio::time::timeout(INDEX_TIMEOUT, probe).await {
                debug!(blob, "tarball probe hit");
                return self.blob_url(&blob);
            }
        }
        self.blob_url(&prefixed_key(&self.prefix, &candidates[0]))
    }

    async fn download_blob(&self, blob: &str, dest: &Path) -> Result<()> {
        let tmp = tmp_sibling(dest);
        let result = async {
            let body = self.read_blob(blob, TRANSFER_TIMEOUT).await?;
            tokio::fs::write(&tmp, &body)
                .await
                .map_err(|e| Error::registry(self.blob_url(blob), RegistryOp::Fetch, e))?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tokio::fs::rename(&tmp, dest)
                    .await
                    .map_err(|e| Error::registry(self.blob_url(blob), RegistryOp::Fetch, e))?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Registry for AzureRegistry {
    fn protocol(&self) -> &'static str {
        "azure"
    }

    async fn get_package_info(&self, name: &str) -> Result<PackageInfo> {
        if self.direct_tarball {
            return tarball_package_info(&self.url);
        }
        match self.mode {
            SourceMode::Package => {
                let manifest = self.load_manifest().await?;
                if !names_match(&manifest.name, name) {
                    return Err(Error::package_not_found(name));
                }
                Ok(PackageInfo {
                    name: manifest.name.clone(),
                    versions: vec![manifest.version.clone()],
                    latest: manifest.version,
                    description: manifest.description,
                })
            }
            _ => {
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
        }
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
        let cache_key = Cache::url_key("azure", &resolved.url);
        let cached = self.cache.path_for(&cache_key);

        if self.cache.has(&cache_key) {
            debug!(cache_key, "cache hit");
        } else {
            self.cache
                .ensure_dir("azure")
                .map_err(|e| Error::install(&resolved.name, InstallPhase::Fetch, e))?;
            let blob = self.blob_from_url(&resolved.url);
            self.download_blob(&blob, &cached).await?;
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
        match self.mode {
            SourceMode::Package => Ok(vec![self.load_manifest().await?.name]),
            _ => Ok(self.load_index().await?.package_names()),
        }
    }
}
