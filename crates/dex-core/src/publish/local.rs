//! Local directory publisher (`file:` registry URLs).
//!
//! Copies the tarball into the registry directory, then folds the new
//! version into `registry.json`. When the index update fails, the
//! freshly copied tarball is removed again so the registry stays
//! consistent.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, PublishPhase, Result};
use crate::index::{REGISTRY_INDEX, RegistryIndex, update_index};
use crate::publish::{PublishResult, Publisher, tarball_integrity, validate_tarball};

#[derive(Debug)]
pub struct LocalPublisher {
    url: String,
    dir: PathBuf,
}

impl LocalPublisher {
    /// Open a local registry directory for publishing. The directory is
    /// created on first publish if it does not exist yet.
    pub fn connect(registry_url: &str) -> Result<Self> {
        let raw = registry_url
            .strip_prefix("file://")
            .or_else(|| registry_url.strip_prefix("file:"))
            .ok_or_else(|| Error::Publish {
                plugin: None,
                url: registry_url.to_string(),
                phase: PublishPhase::Connect,
                cause: Some("not a file: URL".into()),
            })?;
        if raw.is_empty() {
            return Err(Error::Publish {
                plugin: None,
                url: registry_url.to_string(),
                phase: PublishPhase::Connect,
                cause: Some("empty registry path".into()),
            });
        }

        let path = PathBuf::from(raw);
        let dir = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()
                .map_err(|e| {
                    Error::publish(None, registry_url, PublishPhase::Connect, e)
                })?
                .join(path)
        };

        Ok(Self {
            url: registry_url.to_string(),
            dir,
        })
    }

    fn update_index_file(&self, name: &str, version: &str) -> Result<()> {
        let index_path = self.dir.join(REGISTRY_INDEX);
        let current = if index_path.is_file() {
            Some(RegistryIndex::load(&index_path).map_err(|e| {
                Error::publish(Some(name.to_string()), &self.url, PublishPhase::Index, e)
            })?)
        } else {
            None
        };

        let updated = update_index(current, name, version);

        // Atomic replace: write a sibling, then rename into place.
        let tmp_path = index_path.with_extension("json.tmp");
        let write = fs::write(&tmp_path, updated.to_json_pretty())
            .and_then(|()| fs::rename(&tmp_path, &index_path));
        write.map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            Error::publish(Some(name.to_string()), &self.url, PublishPhase::Index, e)
        })
    }
}

#[async_trait]
impl Publisher for LocalPublisher {
    fn protocol(&self) -> &'static str {
        "file"
    }

    async fn publish(&self, tarball: &Path) -> Result<PublishResult> {
        let info = validate_tarball(tarball, &self.url)?;
        let integrity = tarball_integrity(tarball, &self.url, &info.name)?;

        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::publish(Some(info.name.clone()), &self.url, PublishPhase::Upload, e)
        })?;
        let filename = tarball
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dest = self.dir.join(&filename);
        fs::copy(tarball, &dest).map_err(|e| {
            Error::publish(Some(info.name.clone()), &self.url, PublishPhase::Upload, e)
        })?;

        if let Err(e) = self.update_index_file(&info.name, &info.version) {
            // Roll the copy back so a half-published tarball is not left
            // visible in the registry directory.
            let _ = fs::remove_file(&dest);
            return Err(e);
        }
        debug!(dest = %dest.display(), "published {} {}", info.name, info.version);

        Ok(PublishResult {
            name: info.name,
            version: info.version,
            url: format!("file:{}", dest.display()),
            integrity,
            manual_instructions: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_tarball(dir: &Path, filename: &str) -> PathBuf {
        let path = dir.join(filename);
        fs::write(&path, format!("bytes-of-{filename}")).unwrap();
        path
    }

    #[tokio::test]
    async fn test_publish_into_empty_registry() {
        let dir = tempdir().unwrap();
        let registry = dir.path().join("registry");
        let publisher =
            LocalPublisher::connect(&format!("file:{}", registry.display())).unwrap();

        let tarball = make_tarball(dir.path(), "p-1.0.0.tar.gz");
        let result = publisher.publish(&tarball).await.unwrap();

        assert_eq!(result.name, "p");
        assert_eq!(result.version, "1.0.0");
        assert!(result.integrity.starts_with("sha256-"));
        assert!(result.manual_instructions.is_none());
        assert!(registry.join("p-1.0.0.tar.gz").is_file());

        let index = RegistryIndex::load(&registry.join(REGISTRY_INDEX)).unwrap();
        assert_eq!(index.name, "dex-registry");
        assert_eq!(index.packages["p"].versions, vec!["1.0.0"]);
        assert_eq!(index.packages["p"].latest, "1.0.0");
    }

    #[tokio::test]
    async fn test_republish_appends_and_moves_latest() {
        let dir = tempdir().unwrap();
        let registry = dir.path().join("registry");
        let publisher =
            LocalPublisher::connect(&format!("file:{}", registry.display())).unwrap();

        publisher
            .publish(&make_tarball(dir.path(), "p-1.0.0.tar.gz"))
            .await
            .unwrap();
        publisher
            .publish(&make_tarball(dir.path(), "p-1.1.0.tar.gz"))
            .await
            .unwrap();

        let index = RegistryIndex::load(&registry.join(REGISTRY_INDEX)).unwrap();
        assert_eq!(index.packages["p"].versions, vec!["1.0.0", "1.1.0"]);
        assert_eq!(index.packages["p"].latest, "1.1.0");
    }

    #[tokio::test]
    async fn test_index_failure_rolls_back_tarball_copy() {
        let dir = tempdir().unwrap();
        let registry = dir.path().join("registry");
        fs::create_dir(&registry).unwrap();
        fs::write(registry.join(REGISTRY_INDEX), "{corrupt json").unwrap();

        let publisher =
            LocalPublisher::connect(&format!("file:{}", registry.display())).unwrap();
        let err = publisher
            .publish(&make_tarball(dir.path(), "p-1.0.0.tar.gz"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Publish {
                phase: PublishPhase::Index,
                ..
            }
        ));
        assert!(!registry.join("p-1.0.0.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_bad_filename_fails_validation() {
        let dir = tempdir().unwrap();
        let publisher =
            LocalPublisher::connect(&format!("file:{}", dir.path().display())).unwrap();
        let bad = make_tarball(dir.path(), "no-version-here.zip");
        assert!(matches!(
            publisher.publish(&bad).await,
            Err(Error::Publish {
                phase: PublishPhase::Validate,
                ..
            })
        ));
    }
}
