//! Content-addressed download cache and integrity hashing.
//!
//! The cache organizes entries by transport (`git/`, `https/`, `s3/`,
//! `azure/`, `file/`) under one root, keyed by a SHA-256 of the source
//! URL. Integrity strings are SRI-shaped: `sha256-<base64-std>` for the
//! hashes this module computes, `sha256-<lowercase-hex>` for the
//! file-content hashes produced by the packer and publishers.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("integrity mismatch for {path}: expected {expected}, got {actual}")]
    Mismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("unsupported integrity format: {0:?}")]
    UnsupportedFormat(String),
}

/// Transport subdirectories the cache may create.
pub const TRANSPORTS: &[&str] = &["git", "https", "s3", "azure", "file"];

/// On-disk cache rooted at a single directory. The cache owns nothing
/// beyond the path; no cross-process locking is provided.
#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    /// Cache at the default root, `~/.dex/cache`.
    pub fn new() -> Self {
        Self {
            root: crate::cache_path(),
        }
    }

    /// Cache at a custom root (primarily for tests).
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a cache key like `https/<hash>.tar.gz`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Whether an entry exists for the key.
    pub fn has(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }

    /// Create the subdirectory for a transport, returning its path.
    pub fn ensure_dir(&self, transport: &str) -> io::Result<PathBuf> {
        let dir = self.root.join(transport);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove a transport subtree, or the entire cache when `transport`
    /// is empty. Clearing a path that does not exist is not an error.
    pub fn clear(&self, transport: &str) -> io::Result<()> {
        let target = if transport.is_empty() {
            self.root.clone()
        } else {
            self.root.join(transport)
        };
        debug!(path = %target.display(), "clearing cache");
        match fs::remove_dir_all(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Cache key for a tarball fetched from `url` over `transport`:
    /// `{transport}/{hex(sha256(url))}.tar.gz`. Stable across runs.
    pub fn url_key(transport: &str, url: &str) -> String {
        let digest = Sha256::digest(url.as_bytes());
        format!("{transport}/{}.tar.gz", hex::encode(digest))
    }

    /// Cache key for a git checkout of `repo_url` at `reference`
    /// (`HEAD` or `type=value`): a directory under `git/`.
    pub fn git_key(repo_url: &str, reference: &str) -> String {
        let digest = Sha256::digest(format!("{repo_url}#{reference}").as_bytes());
        format!("git/{}", hex::encode(digest))
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

fn file_digest(path: &Path) -> Result<[u8; 32], IntegrityError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Deterministic digest over a directory tree: relative paths (forward
/// slashes, `.git` pruned) sorted ascending, each fed as
/// `path NUL contents NUL`.
fn dir_digest(dir: &Path) -> Result<[u8; 32], IntegrityError> {
    let mut paths: Vec<(String, PathBuf)> = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && e.file_name() == ".git"))
    {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(io::Error::other)?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        paths.push((rel, entry.into_path()));
    }
    paths.sort_by(|(a, _), (b, _)| a.cmp(b));

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    for (rel, path) in paths {
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        let mut file = File::open(&path)?;
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        hasher.update([0u8]);
    }
    Ok(hasher.finalize().into())
}

/// File-content integrity in the cache's format, `sha256-<base64-std>`.
pub fn file_integrity(path: &Path) -> Result<String, IntegrityError> {
    Ok(format!("sha256-{}", BASE64.encode(file_digest(path)?)))
}

/// File-content integrity in the packer/publisher format,
/// `sha256-<lowercase-hex>`.
pub fn file_integrity_hex(path: &Path) -> Result<String, IntegrityError> {
    Ok(format!("sha256-{}", hex::encode(file_digest(path)?)))
}

/// Directory-tree integrity, `sha256-<base64-std>`.
pub fn dir_integrity(dir: &Path) -> Result<String, IntegrityError> {
    Ok(format!("sha256-{}", BASE64.encode(dir_digest(dir)?)))
}

/// Integrity of whatever is at `path`: directory hash for directories,
/// file-content hash otherwise.
pub fn integrity_of(path: &Path) -> Result<String, IntegrityError> {
    if path.is_dir() {
        dir_integrity(path)
    } else {
        file_integrity(path)
    }
}

/// Verify `path` against an expected integrity string. An empty
/// expectation passes; anything not starting with `sha256-` is
/// unsupported. Both digest renderings (hex and base64) are accepted,
/// compared as full strings.
pub fn verify(path: &Path, expected: &str) -> Result<(), IntegrityError> {
    if expected.is_empty() {
        return Ok(());
    }
    if !expected.starts_with("sha256-") {
        return Err(IntegrityError::UnsupportedFormat(expected.to_string()));
    }

    let digest = if path.is_dir() {
        dir_digest(path)?
    } else {
        file_digest(path)?
    };
    let hex_form = format!("sha256-{}", hex::encode(digest));
    let base64_form = format!("sha256-{}", BASE64.encode(digest));
    if expected == hex_form || expected == base64_form {
        return Ok(());
    }

    let looks_hex = expected.len() == "sha256-".len() + 64
        && expected["sha256-".len()..]
            .bytes()
            .all(|b| b.is_ascii_hexdigit());
    Err(IntegrityError::Mismatch {
        path: path.display().to_string(),
        expected: expected.to_string(),
        actual: if looks_hex { hex_form } else { base64_form },
    })
}

/// Verify a cached file, removing it on mismatch so a corrupt entry is
/// never served twice.
pub fn verify_or_remove(path: &Path, expected: &str) -> Result<(), IntegrityError> {
    match verify(path, expected) {
        Err(e @ IntegrityError::Mismatch { .. }) => {
            if path.is_file() {
                debug!(path = %path.display(), "removing cache entry after integrity mismatch");
                let _ = fs::remove_file(path);
            }
            Err(e)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_path_for_and_has() {
        let dir = tempdir().unwrap();
        let cache = Cache::with_root(dir.path().to_path_buf());
        let key = "https/abc.tar.gz";
        assert!(!cache.has(key));

        cache.ensure_dir("https").unwrap();
        fs::write(cache.path_for(key), b"data").unwrap();
        assert!(cache.has(key));
        assert_eq!(cache.path_for(key), dir.path().join("https").join("abc.tar.gz"));
    }

    #[test]
    fn test_clear_semantics() {
        let dir = tempdir().unwrap();
        let cache = Cache::with_root(dir.path().join("cache"));
        cache.ensure_dir("https").unwrap();
        cache.ensure_dir("s3").unwrap();
        fs::write(cache.path_for("https/a"), b"a").unwrap();
        fs::write(cache.path_for("s3/b"), b"b").unwrap();

        cache.clear("https").unwrap();
        assert!(!cache.root().join("https").exists());
        assert!(cache.root().join("s3").exists());

        // Clearing a missing transport is not an error.
        cache.clear("azure").unwrap();

        cache.clear("").unwrap();
        assert!(!cache.root().exists());
        cache.clear("").unwrap();
    }

    #[test]
    fn test_url_key_is_stable() {
        let url = "s3://b/plugin-1.0.0.tar.gz";
        let expected = format!("s3/{}.tar.gz", hex::encode(Sha256::digest(url.as_bytes())));
        assert_eq!(Cache::url_key("s3", url), expected);
        assert_eq!(Cache::url_key("s3", url), Cache::url_key("s3", url));
        assert_ne!(Cache::url_key("s3", url), Cache::url_key("s3", "s3://b/other.tar.gz"));
    }

    #[test]
    fn test_file_integrity_formats() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, b"hello").unwrap();

        let digest = Sha256::digest(b"hello");
        assert_eq!(
            file_integrity(&path).unwrap(),
            format!("sha256-{}", BASE64.encode(digest))
        );
        assert_eq!(
            file_integrity_hex(&path).unwrap(),
            format!("sha256-{}", hex::encode(digest))
        );
    }

    #[test]
    fn test_dir_integrity_deterministic_and_order_independent() {
        let a = tempdir().unwrap();
        fs::create_dir(a.path().join("sub")).unwrap();
        fs::write(a.path().join("sub/z.txt"), b"zzz").unwrap();
        fs::write(a.path().join("a.txt"), b"aaa").unwrap();

        let b = tempdir().unwrap();
        fs::write(b.path().join("a.txt"), b"aaa").unwrap();
        fs::create_dir(b.path().join("sub")).unwrap();
        fs::write(b.path().join("sub/z.txt"), b"zzz").unwrap();

        assert_eq!(dir_integrity(a.path()).unwrap(), dir_integrity(b.path()).unwrap());
    }

    #[test]
    fn test_dir_integrity_sensitive_to_content_and_path() {
        let a = tempdir().unwrap();
        fs::write(a.path().join("a.txt"), b"aaa").unwrap();
        let base = dir_integrity(a.path()).unwrap();

        fs::write(a.path().join("a.txt"), b"bbb").unwrap();
        let changed_content = dir_integrity(a.path()).unwrap();
        assert_ne!(base, changed_content);

        fs::rename(a.path().join("a.txt"), a.path().join("b.txt")).unwrap();
        fs::write(a.path().join("b.txt"), b"aaa").unwrap();
        let changed_path = dir_integrity(a.path()).unwrap();
        assert_ne!(base, changed_path);
    }

    #[test]
    fn test_dir_integrity_skips_git_dir() {
        let a = tempdir().unwrap();
        fs::write(a.path().join("a.txt"), b"aaa").unwrap();
        let without_git = dir_integrity(a.path()).unwrap();

        fs::create_dir(a.path().join(".git")).unwrap();
        fs::write(a.path().join(".git/HEAD"), b"ref: refs/heads/main").unwrap();
        assert_eq!(dir_integrity(a.path()).unwrap(), without_git);
    }

    #[test]
    fn test_dir_integrity_ignores_empty_directories() {
        // Only regular files feed the hash, so directory-only changes
        // leave it untouched.
        let a = tempdir().unwrap();
        fs::write(a.path().join("a.txt"), b"aaa").unwrap();
        let before = dir_integrity(a.path()).unwrap();

        fs::create_dir(a.path().join("empty")).unwrap();
        assert_eq!(dir_integrity(a.path()).unwrap(), before);
    }

    #[test]
    fn test_git_key_distinguishes_refs() {
        let base = Cache::git_key("https://h/r", "HEAD");
        assert_ne!(base, Cache::git_key("https://h/r", "tag=v1.0.0"));
        assert_ne!(base, Cache::git_key("https://h/other", "HEAD"));
        assert_eq!(base, Cache::git_key("https://h/r", "HEAD"));
    }

    #[test]
    fn test_verify_rules() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, b"payload").unwrap();

        verify(&path, "").unwrap();
        verify(&path, &file_integrity(&path).unwrap()).unwrap();
        verify(&path, &file_integrity_hex(&path).unwrap()).unwrap();

        assert!(matches!(
            verify(&path, "md5-abcdef"),
            Err(IntegrityError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            verify(&path, "sha256-deadbeef"),
            Err(IntegrityError::Mismatch { .. })
        ));
    }

    #[test]
    fn test_verify_or_remove_deletes_bad_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entry.tar.gz");
        fs::write(&path, b"corrupt").unwrap();

        let err = verify_or_remove(&path, "sha256-0000").unwrap_err();
        assert!(matches!(err, IntegrityError::Mismatch { .. }));
        assert!(!path.exists());
    }
}
