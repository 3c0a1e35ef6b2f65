//! Git backend (`git+https://…`, `git+ssh://…`, `git+git@host:path`,
//! optional `#ref` fragment).
//!
//! All plumbing goes through the ambient `git` binary, so authentication
//! is whatever the environment provides (credential helper, ssh-agent).
//! Fetched trees are cached without their `.git` directory; observing
//! upstream changes requires a different ref (and so a different key).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::cache::Cache;
use crate::error::{Error, InstallPhase, RegistryOp, Result};
use crate::index::{REGISTRY_INDEX, RegistryIndex};
use crate::manifest::Manifest;
use crate::naming::names_match;
use crate::registry::{
    PackageInfo, Registry, ResolvedPackage, SourceMode, TRANSFER_TIMEOUT, select_version,
};
use crate::version::{Version, sort_version_strings};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GitUrlError {
    #[error("invalid git URL {url:?}: {reason}")]
    InvalidGitUrl { url: String, reason: String },
}

/// Requested ref, from the URL fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitRef {
    Default,
    Tag(String),
    Branch(String),
    Commit(String),
}

impl GitRef {
    /// Token used in the cache key: `HEAD` or `type=value`.
    pub fn cache_token(&self) -> String {
        match self {
            Self::Default => "HEAD".to_string(),
            Self::Tag(v) => format!("tag={v}"),
            Self::Branch(v) => format!("branch={v}"),
            Self::Commit(v) => format!("commit={v}"),
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Self::Default => None,
            Self::Tag(v) | Self::Branch(v) | Self::Commit(v) => Some(v),
        }
    }
}

/// A parsed `git+{scheme}{rest}[#REF]` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitUrl {
    pub repo: String,
    pub reference: GitRef,
}

/// Parse the git source grammar. Fragment refs are `{type}={value}` with
/// `type` one of `tag`, `branch`, `commit`, or a bare value implicitly
/// typed as `tag`.
pub fn parse_git_url(url: &str) -> std::result::Result<GitUrl, GitUrlError> {
    let rest = url.strip_prefix("git+").ok_or_else(|| GitUrlError::InvalidGitUrl {
        url: url.to_string(),
        reason: "missing git+ prefix".to_string(),
    })?;

    let (repo, fragment) = match rest.split_once('#') {
        Some((repo, fragment)) => (repo, Some(fragment)),
        None => (rest, None),
    };

    if !repo.starts_with("https://") && !repo.starts_with("ssh://") && !repo.starts_with("git@") {
        return Err(GitUrlError::InvalidGitUrl {
            url: url.to_string(),
            reason: "scheme must be https://, ssh://, or git@".to_string(),
        });
    }

    let reference = match fragment {
        None | Some("") => GitRef::Default,
        Some(fragment) => match fragment.split_once('=') {
            Some(("tag", v)) => GitRef::Tag(v.to_string()),
            Some(("branch", v)) => GitRef::Branch(v.to_string()),
            Some(("commit", v)) => GitRef::Commit(v.to_string()),
            Some((other, _)) => {
                return Err(GitUrlError::InvalidGitUrl {
                    url: url.to_string(),
                    reason: format!("unknown ref type {other:?}"),
                });
            }
            None => GitRef::Tag(fragment.to_string()),
        },
    };

    Ok(GitUrl {
        repo: repo.to_string(),
        reference,
    })
}

/// Tag name chosen for a resolved version: `v{version}` when the remote
/// has it, the bare version when it has that, otherwise the ref the
/// source URL asked for (falling back to the version itself).
fn choose_tag(tags: &[String], version: &str, original_ref: &GitRef) -> String {
    let prefixed = format!("v{version}");
    if tags.iter().any(|t| t == &prefixed) {
        return prefixed;
    }
    if tags.iter().any(|t| t == version) {
        return version.to_string();
    }
    original_ref
        .value()
        .map_or_else(|| version.to_string(), str::to_string)
}

pub struct GitRegistry {
    url: String,
    source: GitUrl,
    mode: SourceMode,
    cache: Cache,
    clone_dir: OnceCell<tempfile::TempDir>,
    tags: OnceCell<Vec<String>>,
}

impl std::fmt::Debug for GitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRegistry")
            .field("repo", &self.source.repo)
            .field("reference", &self.source.reference)
            .finish()
    }
}

impl GitRegistry {
    pub fn connect(url: &str, mode: SourceMode, cache: Cache) -> Result<Self> {
        let source =
            parse_git_url(url).map_err(|e| Error::registry(url, RegistryOp::Parse, e))?;
        Ok(Self {
            url: url.to_string(),
            source,
            mode,
            cache,
            clone_dir: OnceCell::new(),
            tags: OnceCell::new(),
        })
    }

    async fn run_git(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(?args, "running git");
        let run = Command::new("git").args(args).output();
        let output = tokio::time::timeout(TRANSFER_TIMEOUT, run)
            .await
            .map_err(|e| Error::registry(&self.url, RegistryOp::Fetch, e))?
            .map_err(|e| Error::registry(&self.url, RegistryOp::Fetch, e))?;
        if !output.status.success() {
            return Err(Error::registry_msg(
                &self.url,
                RegistryOp::Fetch,
                format!(
                    "git {} failed: {}",
                    args.first().unwrap_or(&""),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(output)
    }

    /// Shallow-clone the source at its requested ref into `target`.
    async fn clone_ref(&self, reference: &GitRef, target: &Path) -> Result<()> {
        let target_str = target.display().to_string();
        match reference {
            GitRef::Commit(commit) => {
                // An arbitrary commit cannot be fetched shallowly by name.
                self.run_git(&["clone", &self.source.repo, &target_str]).await?;
                self.run_git(&["-C", &target_str, "checkout", "--detach", commit])
                    .await?;
            }
            GitRef::Tag(value) | GitRef::Branch(value) => {
                self.run_git(&[
                    "clone", "--depth", "1", "--branch", value, &self.source.repo, &target_str,
                ])
                .await?;
            }
            GitRef::Default => {
                self.run_git(&["clone", "--depth", "1", &self.source.repo, &target_str])
                    .await?;
            }
        }
        Ok(())
    }

    /// One shallow clone per registry handle, reused by every metadata
    /// read.
    async fn ensure_clone(&self) -> Result<PathBuf> {
        let dir = self
            .clone_dir
            .get_or_try_init(|| async {
                let dir = tempfile::tempdir()
                    .map_err(|e| Error::registry(&self.url, RegistryOp::Fetch, e))?;
                let checkout = dir.path().join("checkout");
                self.clone_ref(&self.source.reference, &checkout).await?;
                Ok::<_, Error>(dir)
            })
            .await?;
        Ok(dir.path().join("checkout"))
    }

    /// Remote tag names via `git ls-remote --tags`, listed once per
    /// registry handle. Dereference suffixes (`^{}`) are skipped.
    async fn list_tags(&self) -> Result<&[String]> {
        let tags = self
            .tags
            .get_or_try_init(|| async {
                let output = self
                    .run_git(&["ls-remote", "--tags", &self.source.repo])
                    .await?;
                let stdout = String::from_utf8_lossy(&output.stdout);
                let mut tags = Vec::new();
                for line in stdout.lines() {
                    let Some(reference) = line.split_whitespace().nth(1) else {
                        continue;
                    };
                    if let Some(tag) = reference.strip_prefix("refs/tags/") {
                        if !tag.ends_with("^{}") {
                            tags.push(tag.to_string());
                        }
                    }
                }
                Ok::<_, Error>(tags)
            })
            .await?;
        Ok(tags)
    }

    async fn effective_mode(&self) -> Result<SourceMode> {
        match self.mode {
            SourceMode::Auto => {
                let checkout = self.ensure_clone().await?;
                if checkout.join(REGISTRY_INDEX).is_file() {
                    Ok(SourceMode::Registry)
                } else {
                    Ok(SourceMode::Package)
                }
            }
            explicit => Ok(explicit),
        }
    }

    /// Versions exposed for package mode: remote tags that parse as
    /// semver, leading `v` stripped, semver-sorted ascending.
    async fn tag_versions(&self) -> Result<Vec<String>> {
        let tags = self.list_tags().await?;
        let versions: Vec<String> = tags
            .iter()
            .filter(|tag| Version::parse(tag).is_ok())
            .map(|tag| tag.trim_start_matches('v').to_string())
            .collect();
        Ok(sort_version_strings(&versions))
    }
}

#[async_trait]
impl Registry for GitRegistry {
    fn protocol(&self) -> &'static str {
        "git"
    }

    async fn get_package_info(&self, name: &str) -> Result<PackageInfo> {
        let checkout = self.ensure_clone().await?;
        match self.effective_mode().await? {
            SourceMode::Package => {
                let manifest = Manifest::load(&checkout)?;
                if !names_match(&manifest.name, name) {
                    return Err(Error::package_not_found(name));
                }
                let mut versions = self.tag_versions().await?;
                if versions.is_empty() {
                    versions.push(manifest.version.clone());
                }
                let latest = versions.last().cloned().unwrap_or_default();
                Ok(PackageInfo {
                    name: manifest.name.clone(),
                    versions,
                    latest,
                    description: manifest.description,
                })
            }
            _ => {
                let index = RegistryIndex::load(&checkout.join(REGISTRY_INDEX))?;
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
        let info = self.get_package_info(name).await?;
        let version = select_version(&info, name, spec)?;
        let tags = self.list_tags().await?;
        let tag = choose_tag(tags, &version, &self.source.reference);

        Ok(ResolvedPackage {
            name: info.name,
            version,
            url: format!("git+{}#tag={tag}", self.source.repo),
            local_path: None,
            integrity: None,
        })
    }

    async fn fetch(&self, resolved: &ResolvedPackage, dest: &Path) -> Result<PathBuf> {
        let source = parse_git_url(&resolved.url)
            .map_err(|e| Error::registry(&resolved.url, RegistryOp::Parse, e))?;
        let key = Cache::git_key(&source.repo, &source.reference.cache_token());
        let cached = self.cache.path_for(&key);
        let target = dest.join(&resolved.name);

        if target.exists() {
            std::fs::remove_dir_all(&target)
                .map_err(|e| Error::install(&resolved.name, InstallPhase::Install, e))?;
        }

        let copy_options = fs_extra::dir::CopyOptions::new()
            .content_only(true)
            .overwrite(true);

        if cached.is_dir() {
            debug!(key, "git cache hit");
            std::fs::create_dir_all(&target)
                .map_err(|e| Error::install(&resolved.name, InstallPhase::Install, e))?;
            fs_extra::dir::copy(&cached, &target, &copy_options)
                .map_err(|e| Error::install(&resolved.name, InstallPhase::Install, e))?;
            return Ok(target);
        }

        // Miss: clone, drop the .git directory, then seed the cache with
        // the stripped tree.
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::install(&resolved.name, InstallPhase::Install, e))?;
        }
        self.clone_ref(&source.reference, &target).await?;
        let git_dir = target.join(".git");
        if git_dir.exists() {
            std::fs::remove_dir_all(&git_dir)
                .map_err(|e| Error::install(&resolved.name, InstallPhase::Install, e))?;
        }

        self.cache
            .ensure_dir("git")
            .map_err(|e| Error::install(&resolved.name, InstallPhase::Install, e))?;
        std::fs::create_dir_all(&cached)
            .map_err(|e| Error::install(&resolved.name, InstallPhase::Install, e))?;
        fs_extra::dir::copy(&target, &cached, &copy_options)
            .map_err(|e| Error::install(&resolved.name, InstallPhase::Install, e))?;

        Ok(target)
    }

    async fn list_packages(&self) -> Result<Vec<String>> {
        let checkout = self.ensure_clone().await?;
        match self.effective_mode().await? {
            SourceMode::Package => Ok(vec![Manifest::load(&checkout)?.name]),
            _ => Ok(RegistryIndex::load(&checkout.join(REGISTRY_INDEX))?.package_names()),
        }
    }
}
