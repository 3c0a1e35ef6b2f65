//! HTTP(S) backend.
//!
//! Index reads and existence probes use a short-timeout client; tarball
//! downloads use a separate long-timeout client. Package mode has no
//! manifest protocol over plain HTTP(S) and is rejected outright.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::cache::Cache;
use crate::error::{Error, InstallPhase, RegistryOp, Result};
use crate::index::{REGISTRY_INDEX, RegistryIndex};
use crate::io::download::download_to;
use crate::naming::{candidate_tarball_names, filename_from_url, is_tarball_url, parse_tarball_filename};
use crate::registry::{
    INDEX_TIMEOUT, PackageInfo, Registry, ResolvedPackage, SourceMode, TRANSFER_TIMEOUT,
    select_version, tarball_package_info, verify_and_extract,
};

#[derive(Debug)]
pub struct HttpRegistry {
    base_url: String,
    mode: SourceMode,
    cache: Cache,
    client: Client,
    download_client: Client,
    direct_tarball: bool,
}

impl HttpRegistry {
    /// Open an HTTP(S) source. Both clients are built eagerly and live
    /// for the registry's lifetime.
    pub fn connect(url: &str, mode: SourceMode, cache: Cache) -> Result<Self> {
        if !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(Error::registry_msg(
                url,
                RegistryOp::Connect,
                "not an http(s) URL",
            ));
        }

        let direct_tarball = is_tarball_url(url);
        let base_url = if direct_tarball {
            url.to_string()
        } else {
            url.trim_end_matches('/').to_string()
        };

        let client = Client::builder()
            .timeout(INDEX_TIMEOUT)
            .build()
            .map_err(|e| Error::registry(url, RegistryOp::Connect, e))?;
        let download_client = Client::builder()
            .timeout(TRANSFER_TIMEOUT)
            .build()
            .map_err(|e| Error::registry(url, RegistryOp::Connect, e))?;

        Ok(Self {
            base_url,
            mode,
            cache,
            client,
            download_client,
            direct_tarball,
        })
    }

    async fn load_index(&self) -> Result<RegistryIndex> {
        let index_url = format!("{}/{REGISTRY_INDEX}", self.base_url);
        let response = self
            .client
            .get(&index_url)
            .send()
            .await
            .map_err(|e| Error::registry(&index_url, RegistryOp::Fetch, e))?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::registry_msg(
                &index_url,
                RegistryOp::Fetch,
                format!("unexpected status {status}"),
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|e| Error::registry(&index_url, RegistryOp::Fetch, e))?;
        RegistryIndex::from_json(&body, &index_url)
            .map_err(|e| Error::registry(&index_url, RegistryOp::Parse, e))
    }

    /// Probe the four conventional tarball names with HEAD requests and
    /// take the first hit; when every probe misses, fall back to the
    /// first pattern and let the eventual GET produce the error.
    async fn tarball_url(&self, name: &str, version: &str) -> String {
        let candidates = candidate_tarball_names(name, version);
        for candidate in &candidates {
            let url = format!("{}/{candidate}", self.base_url);
            match self.client.head(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url, "tarball probe hit");
                    return url;
                }
                _ => {}
            }
        }
        format!("{}/{}", self.base_url, candidates[0])
    }

    fn unsupported_package_mode(&self) -> Error {
        Error::registry_msg(
            &self.base_url,
            RegistryOp::Fetch,
            "package mode is not supported over http(s); use a registry root or a direct tarball URL",
        )
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    fn protocol(&self) -> &'static str {
        "https"
    }

    async fn get_package_info(&self, name: &str) -> Result<PackageInfo> {
        if self.direct_tarball {
            return tarball_package_info(&self.base_url);
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
            let info = tarball_package_info(&self.base_url)?;
            return Ok(ResolvedPackage {
                name: info.name,
                version: info.latest,
                url: self.base_url.clone(),
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
        let key = Cache::url_key("https", &resolved.url);
        let cached = self.cache.path_for(&key);

        if self.cache.has(&key) {
            debug!(key, "cache hit");
        } else {
            self.cache
                .ensure_dir("https")
                .map_err(|e| Error::install(&resolved.name, InstallPhase::Fetch, e))?;
            download_to(&self.download_client, &resolved.url, &cached)
                .await
                .map_err(|e| Error::install(&resolved.name, InstallPhase::Fetch, e))?;
        }

        verify_and_extract(&resolved.name, &cached, resolved.integrity.as_deref(), dest)
    }

    async fn list_packages(&self) -> Result<Vec<String>> {
        if self.direct_tarball {
            let filename = filename_from_url(&self.base_url);
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
