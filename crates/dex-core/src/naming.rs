//! Tarball naming and URL utilities shared by every backend.

use std::sync::OnceLock;

use regex::Regex;

/// Name and version parsed from a tarball filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballInfo {
    pub name: String,
    pub version: String,
}

fn tarball_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(.+?)[-_]v?(\d+(?:\.\d+)?(?:\.\d+)?(?:-[0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*)?(?:\+[0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*)?)\.(?:tar\.gz|tgz)$",
        )
        .expect("tarball filename regex is valid")
    })
}

/// Parse `{name}-{version}.tar.gz` (also `_` separator, optional `v`
/// prefix, `.tgz` suffix) into its name and version parts.
pub fn parse_tarball_filename(filename: &str) -> Option<TarballInfo> {
    let caps = tarball_re().captures(filename)?;
    Some(TarballInfo {
        name: caps.get(1)?.as_str().to_string(),
        version: caps.get(2)?.as_str().to_string(),
    })
}

/// Whether the URL's path ends in `.tar.gz` or `.tgz`, case-insensitively.
pub fn is_tarball_url(url: &str) -> bool {
    let path = strip_query_and_fragment(url).to_ascii_lowercase();
    path.ends_with(".tar.gz") || path.ends_with(".tgz")
}

/// The path component after the last `/`, with query string and fragment
/// stripped. Empty when the URL ends in a slash.
pub fn filename_from_url(url: &str) -> String {
    let path = strip_query_and_fragment(url);
    match path.rsplit_once('/') {
        Some((_, name)) => name.to_string(),
        None => path.to_string(),
    }
}

fn strip_query_and_fragment(url: &str) -> &str {
    let url = url.split_once('?').map_or(url, |(head, _)| head);
    url.split_once('#').map_or(url, |(head, _)| head)
}

/// Canonical name form: underscores become hyphens, everything lowercased.
pub fn normalize_name(name: &str) -> String {
    name.replace('_', "-").to_ascii_lowercase()
}

/// Whether two names are equal after normalization.
pub fn names_match(a: &str, b: &str) -> bool {
    normalize_name(a) == normalize_name(b)
}

/// Conventional tarball filename for a package at a version.
pub fn tarball_filename(name: &str, version: &str) -> String {
    format!("{name}-{version}.tar.gz")
}

/// Filename patterns probed, in order, when resolving a tarball URL for a
/// package whose registry entry does not carry one.
pub fn candidate_tarball_names(name: &str, version: &str) -> [String; 4] {
    [
        format!("{name}-{version}.tar.gz"),
        format!("{name}-v{version}.tar.gz"),
        format!("{name}_{version}.tar.gz"),
        format!("{name}-{version}.tgz"),
    ]
}
