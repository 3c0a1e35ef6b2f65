//! Safe gzip+tar extraction.
//!
//! The single traversal guard: any entry whose name contains `..` is
//! rejected before anything touches the filesystem.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::EntryType;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid path in tarball: {0:?}")]
    InvalidTarballPath(String),

    #[error("entry {0:?} is missing its link target")]
    MissingLinkTarget(String),
}

/// Extract a `.tar.gz` archive into `dest_dir`.
///
/// Returns `dest_dir/{top}` when every entry lives under exactly one
/// top-level directory, `dest_dir` otherwise.
pub fn extract_tarball(archive_path: &Path, dest_dir: &Path) -> Result<PathBuf, ExtractError> {
    fs::create_dir_all(dest_dir)?;

    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut top_segments: BTreeSet<String> = BTreeSet::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        if name.contains("..") {
            return Err(ExtractError::InvalidTarballPath(name));
        }

        if let Some(first) = name
            .split('/')
            .find(|segment| !segment.is_empty())
            .filter(|segment| *segment != ".")
        {
            top_segments.insert(first.to_string());
        }

        let rel: PathBuf = entry.path()?.components().collect();
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest_dir.join(&rel);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                set_mode(&target, entry.header().mode().unwrap_or(0), 0o755)?;
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()?
                    .ok_or_else(|| ExtractError::MissingLinkTarget(name.clone()))?
                    .into_owned();
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                if target.symlink_metadata().is_ok() {
                    fs::remove_file(&target)?;
                }
                make_symlink(&link, &target)?;
            }
            EntryType::Link => {
                let link = entry
                    .link_name()?
                    .ok_or_else(|| ExtractError::MissingLinkTarget(name.clone()))?
                    .into_owned();
                let source = dest_dir.join(&link);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::hard_link(&source, &target)?;
            }
            _ => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&target)?;
                io::copy(&mut entry, &mut out)?;
                set_mode(&target, entry.header().mode().unwrap_or(0), 0o644)?;
            }
        }
    }

    let result = if top_segments.len() == 1 {
        let top = top_segments.into_iter().next().unwrap_or_default();
        dest_dir.join(top)
    } else {
        dest_dir.to_path_buf()
    };
    debug!(archive = %archive_path.display(), dest = %result.display(), "extracted tarball");
    Ok(result)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32, fallback: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if mode == 0 { fallback } else { mode };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32, _fallback: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn make_symlink(_link: &Path, target: &Path) -> io::Result<()> {
    // Symlink entries degrade to nothing on platforms without them.
    let _ = target;
    Ok(())
}
