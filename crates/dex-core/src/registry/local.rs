//! Local filesystem backend (`file:` URLs).
//!
//! Fetch never copies: the extracted-tree contract is satisfied by the
//! package's on-disk directory itself.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::cache;
use crate::error::{Error, InstallPhase, RegistryOp, Result};
use crate::index::{REGISTRY_INDEX, RegistryIndex};
use crate::manifest::Manifest;
use crate::naming::{filename_from_url, is_tarball_url, names_match, parse_tarball_filename};
use crate::registry::{
    PackageInfo, Registry, ResolvedPackage, SourceMode, select_version, tarball_package_info,
    verify_and_extract,
};

#[derive(Debug)]
pub struct LocalRegistry {
    url: String,
    root: PathBuf,
    mode: SourceMode,
    direct_tarball: bool,
}

impl LocalRegistry {
    /// Open a local source. The path must exist; in `Auto` mode the
    /// presence of `registry.json` selects registry mode.
    pub fn connect(url: &str, mode: SourceMode) -> Result<Self> {
        let raw = url
            .strip_prefix("file://")
            .or_else(|| url.strip_prefix("file:"))
            .ok_or_else(|| Error::registry_msg(url, RegistryOp::Connect, "not a file: URL"))?;
        if raw.is_empty() {
            return Err(Error::registry_msg(url, RegistryOp::Connect, "empty path"));
        }

        let path = PathBuf::from(raw);
        let absolute = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()
                .map_err(|e| Error::registry(url, RegistryOp::Connect, e))?
                .join(path)
        };
        let root = fs::canonicalize(&absolute)
            .map_err(|e| Error::registry(url, RegistryOp::Connect, e))?;

        let direct_tarball = is_tarball_url(url);
        if direct_tarball {
            if !root.is_file() {
                return Err(Error::registry_msg(
                    url,
                    RegistryOp::Connect,
                    "tarball path is not a file",
                ));
            }
            return Ok(Self {
                url: url.to_string(),
                root,
                mode: SourceMode::Package,
                direct_tarball,
            });
        }

        if !root.is_dir() {
            return Err(Error::registry_msg(
                url,
                RegistryOp::Connect,
                "path is not a directory",
            ));
        }

        let mode = match mode {
            SourceMode::Auto => {
                if root.join(REGISTRY_INDEX).is_file() {
                    SourceMode::Registry
                } else {
                    SourceMode::Package
                }
            }
            explicit => explicit,
        };
        debug!(root = %root.display(), ?mode, "opened local source");

        Ok(Self {
            url: url.to_string(),
            root,
            mode,
            direct_tarball,
        })
    }

    fn load_index(&self) -> Result<RegistryIndex> {
        RegistryIndex::load(&self.root.join(REGISTRY_INDEX))
    }

    /// The on-disk tree for a resolved package: `{root}/{name}/` or
    /// `{root}/{name}-{version}/`.
    fn package_dir(&self, name: &str, version: &str) -> Result<PathBuf> {
        match self.mode {
            SourceMode::Package => Ok(self.root.clone()),
            _ => {
                let plain = self.root.join(name);
                if plain.is_dir() {
                    return Ok(plain);
                }
                let versioned = self.root.join(format!("{name}-{version}"));
                if versioned.is_dir() {
                    return Ok(versioned);
                }
                Err(Error::NotFound {
                    kind: "package directory".to_string(),
                    name: format!("{name} {version}"),
                })
            }
        }
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    fn protocol(&self) -> &'static str {
        "file"
    }

    async fn get_package_info(&self, name: &str) -> Result<PackageInfo> {
        if self.direct_tarball {
            return tarball_package_info(&self.url);
        }
        match self.mode {
            SourceMode::Package => {
                let manifest = Manifest::load(&self.root)?;
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
                let index = self.load_index()?;
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
            let integrity = cache::file_integrity(&self.root)
                .map_err(|e| Error::registry(&self.url, RegistryOp::Resolve, e))?;
            return Ok(ResolvedPackage {
                name: info.name,
                version: info.latest,
                url: self.url.clone(),
                local_path: Some(self.root.clone()),
                integrity: Some(integrity),
            });
        }

        let info = self.get_package_info(name).await?;
        let version = select_version(&info, name, spec)?;
        let dir = self.package_dir(&info.name, &version)?;
        let integrity = cache::dir_integrity(&dir)
            .map_err(|e| Error::registry(&self.url, RegistryOp::Resolve, e))?;

        Ok(ResolvedPackage {
            name: info.name,
            version,
            url: format!("file:{}", dir.display()),
            local_path: Some(dir),
            integrity: Some(integrity),
        })
    }

    async fn fetch(&self, resolved: &ResolvedPackage, dest: &Path) -> Result<PathBuf> {
        if self.direct_tarball {
            return verify_and_extract(
                &resolved.name,
                &self.root,
                resolved.integrity.as_deref(),
                dest,
            );
        }

        let dir = match &resolved.local_path {
            Some(path) if path.exists() => path.clone(),
            _ => self.package_dir(&resolved.name, &resolved.version)?,
        };
        if let Some(expected) = resolved.integrity.as_deref() {
            cache::verify(&dir, expected)
                .map_err(|e| Error::install(&resolved.name, InstallPhase::Verify, e))?;
        }
        Ok(dir)
    }

    async fn list_packages(&self) -> Result<Vec<String>> {
        if self.direct_tarball {
            let filename = filename_from_url(&self.url);
            return Ok(parse_tarball_filename(&filename)
                .map(|t| vec![t.name])
                .unwrap_or_default());
        }
        match self.mode {
            SourceMode::Package => Ok(vec![Manifest::load(&self.root)?.name]),
            _ => Ok(self.load_index()?.package_names()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry_fixture(root: &Path) {
        fs::write(
            root.join(REGISTRY_INDEX),
            r#"{
  "name": "r",
  "version": "1.0",
  "packages": {
    "p": { "versions": ["1.0.0", "1.1.0", "2.0.0"], "latest": "2.0.0" }
  }
}
"#,
        )
        .unwrap();
        let pkg = root.join("p");
        fs::create_dir(&pkg).unwrap();
        fs::write(pkg.join("plugin.toml"), "name = \"p\"\nversion = \"2.0.0\"\n").unwrap();
        fs::write(pkg.join("main.txt"), b"code").unwrap();
    }

    #[tokio::test]
    async fn test_auto_mode_detects_registry() {
        let dir = tempdir().unwrap();
        registry_fixture(dir.path());
        let reg = LocalRegistry::connect(
            &format!("file:{}", dir.path().display()),
            SourceMode::Auto,
        )
        .unwrap();
        assert_eq!(reg.protocol(), "file");

        let info = reg.get_package_info("p").await.unwrap();
        assert_eq!(info.versions, vec!["1.0.0", "1.1.0", "2.0.0"]);
        assert_eq!(info.latest, "2.0.0");
    }

    #[tokio::test]
    async fn test_resolve_constraint_picks_best_match() {
        let dir = tempdir().unwrap();
        registry_fixture(dir.path());
        let reg = LocalRegistry::connect(
            &format!("file:{}", dir.path().display()),
            SourceMode::Auto,
        )
        .unwrap();

        let resolved = reg.resolve("p", "^1.0.0").await.unwrap();
        assert_eq!(resolved.version, "1.1.0");
        assert!(resolved.integrity.as_deref().unwrap().starts_with("sha256-"));
        let expected = fs::canonicalize(dir.path()).unwrap().join("p");
        assert_eq!(resolved.local_path.as_deref(), Some(expected.as_path()));
    }

    #[tokio::test]
    async fn test_fetch_returns_on_disk_path_without_copy() {
        let dir = tempdir().unwrap();
        registry_fixture(dir.path());
        let reg = LocalRegistry::connect(
            &format!("file:{}", dir.path().display()),
            SourceMode::Auto,
        )
        .unwrap();

        let resolved = reg.resolve("p", "latest").await.unwrap();
        let dest = dir.path().join("unused-dest");
        let fetched = reg.fetch(&resolved, &dest).await.unwrap();
        assert_eq!(fetched, fs::canonicalize(dir.path()).unwrap().join("p"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_package_mode_single_version() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("plugin.toml"),
            "name = \"solo\"\nversion = \"0.3.0\"\ndescription = \"one\"\n",
        )
        .unwrap();

        let reg = LocalRegistry::connect(
            &format!("file:{}", dir.path().display()),
            SourceMode::Auto,
        )
        .unwrap();
        let info = reg.get_package_info("solo").await.unwrap();
        assert_eq!(info.versions, vec!["0.3.0"]);
        assert_eq!(info.description.as_deref(), Some("one"));

        // Name matching is normalized.
        assert!(reg.get_package_info("SOLO").await.is_ok());
        assert!(matches!(
            reg.get_package_info("other").await,
            Err(Error::NotFound { .. })
        ));

        assert_eq!(reg.list_packages().await.unwrap(), vec!["solo"]);
    }

    #[tokio::test]
    async fn test_versioned_package_dir_fallback() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(REGISTRY_INDEX),
            r#"{"name":"r","version":"1.0","packages":{"q":{"versions":["1.0.0"],"latest":"1.0.0"}}}"#,
        )
        .unwrap();
        let pkg = dir.path().join("q-1.0.0");
        fs::create_dir(&pkg).unwrap();
        fs::write(pkg.join("plugin.toml"), "name = \"q\"\nversion = \"1.0.0\"\n").unwrap();

        let reg = LocalRegistry::connect(
            &format!("file:{}", dir.path().display()),
            SourceMode::Auto,
        )
        .unwrap();
        let resolved = reg.resolve("q", "latest").await.unwrap();
        let expected = fs::canonicalize(&pkg).unwrap();
        assert_eq!(resolved.local_path.as_deref(), Some(expected.as_path()));
    }

    #[tokio::test]
    async fn test_missing_path_is_connect_error() {
        let err =
            LocalRegistry::connect("file:/definitely/not/here", SourceMode::Auto).unwrap_err();
        assert!(matches!(
            err,
            Error::Registry {
                op: RegistryOp::Connect,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_no_match_is_version_error() {
        let dir = tempdir().unwrap();
        registry_fixture(dir.path());
        let reg = LocalRegistry::connect(
            &format!("file:{}", dir.path().display()),
            SourceMode::Auto,
        )
        .unwrap();
        assert!(matches!(
            reg.resolve("p", "^9.0.0").await,
            Err(Error::Version { .. })
        ));
    }
}
