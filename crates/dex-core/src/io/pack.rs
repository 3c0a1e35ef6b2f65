//! Tarball packing: gzip+tar with a single top-level directory and a
//! SHA-256 computed over the exact bytes written.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, PackPhase, Result};
use crate::manifest::Manifest;
use crate::naming::tarball_filename;

/// Patterns excluded from an archive when no custom list is given.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".env",
    "*.pyc",
    "build",
    "dist",
    ".DS_Store",
    "*.swp",
    "*.swo",
    ".vscode",
    ".idea",
];

/// Options for [`pack`]. A custom exclusion list replaces the default
/// entirely.
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    /// Output path; defaults to `{name}-{version}.tar.gz` in the current
    /// working directory.
    pub output: Option<PathBuf>,
    /// Exclusion patterns; `None` means [`DEFAULT_EXCLUDES`].
    pub exclude: Option<Vec<String>>,
}

/// What a packing run produced.
#[derive(Debug, Clone)]
pub struct PackResult {
    pub output: PathBuf,
    pub size: u64,
    /// `sha256-<lowercase-hex>` over the written archive bytes.
    pub integrity: String,
    pub name: String,
    pub version: String,
}

enum ExcludeRule {
    Glob(glob::Pattern),
    Literal(String),
}

impl ExcludeRule {
    fn compile(patterns: &[String]) -> Vec<Self> {
        patterns
            .iter()
            .filter_map(|p| {
                if p.contains('*') {
                    glob::Pattern::new(p).ok().map(Self::Glob)
                } else {
                    Some(Self::Literal(p.clone()))
                }
            })
            .collect()
    }

    fn matches(&self, base_name: &str) -> bool {
        match self {
            Self::Glob(pattern) => pattern.matches(base_name),
            Self::Literal(literal) => literal == base_name,
        }
    }
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Pack `src_dir` into a gzip+tar archive rooted at one top-level
/// directory named `{name}-{version}`, per the directory's manifest.
///
/// On any failure after the output file is created, the partial output
/// is removed before the error is returned.
pub fn pack(src_dir: &Path, options: &PackOptions) -> Result<PackResult> {
    let dir_label = src_dir.display().to_string();

    let manifest = Manifest::load(src_dir).map_err(|e| {
        let phase = if matches!(e, Error::Validation { .. }) {
            PackPhase::Validate
        } else {
            PackPhase::Read
        };
        Error::pack(&dir_label, phase, e)
    })?;
    let name = manifest.name.clone();
    let version = manifest.version.clone();

    let output = match &options.output {
        Some(path) => path.clone(),
        None => std::env::current_dir()
            .map_err(|e| Error::pack(&dir_label, PackPhase::Compress, e))?
            .join(tarball_filename(&name, &version)),
    };

    let default_patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| (*s).to_string()).collect();
    let patterns = options.exclude.as_deref().unwrap_or(&default_patterns);
    let rules = ExcludeRule::compile(patterns);

    let top = format!("{name}-{version}");
    match write_archive(src_dir, &output, &top, &rules) {
        Ok((size, digest)) => {
            debug!(output = %output.display(), size, "packed {top}");
            Ok(PackResult {
                output,
                size,
                integrity: format!("sha256-{}", hex::encode(digest)),
                name,
                version,
            })
        }
        Err(e) => {
            let _ = fs::remove_file(&output);
            Err(Error::pack(&dir_label, PackPhase::Compress, e))
        }
    }
}

fn write_archive(
    src_dir: &Path,
    output: &Path,
    top: &str,
    rules: &[ExcludeRule],
) -> io::Result<(u64, [u8; 32])> {
    let file = File::create(output)?;
    let encoder = GzEncoder::new(HashingWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    builder.append_dir(top, src_dir)?;

    let walker = WalkDir::new(src_dir).min_depth(1).into_iter();
    for entry in walker.filter_entry(|e| {
        !rules
            .iter()
            .any(|rule| rule.matches(&e.file_name().to_string_lossy()))
    }) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(io::Error::other)?;
        let tar_path = Path::new(top).join(rel);
        let meta = fs::symlink_metadata(entry.path())?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(entry.path())?;
            let mut header = tar::Header::new_gnu();
            header.set_metadata(&meta);
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, &tar_path, &target)?;
        } else if meta.is_dir() {
            builder.append_dir(&tar_path, entry.path())?;
        } else {
            let mut source = File::open(entry.path())?;
            builder.append_file(&tar_path, &mut source)?;
        }
    }

    let encoder = builder.into_inner()?;
    let mut tee = encoder.finish()?;
    tee.flush()?;
    Ok((tee.written, tee.hasher.finalize().into()))
}
