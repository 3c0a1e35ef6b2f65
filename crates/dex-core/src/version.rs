//! SemVer parsing, total ordering, and the constraint algebra used for
//! version selection.
//!
//! Accepts `[v]MAJOR[.MINOR[.PATCH]][-PRERELEASE][+BUILD]`; missing minor
//! and patch default to zero. Build metadata is carried through untouched
//! but never participates in comparison or equality.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version: {0:?}")]
    InvalidVersion(String),

    #[error("invalid constraint: {0:?}")]
    InvalidConstraint(String),
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^v?(\d+)(?:\.(\d+))?(?:\.(\d+))?(?:-([0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?(?:\+([0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?$",
        )
        .expect("version regex is valid")
    })
}

/// A parsed semantic version.
#[derive(Debug, Clone)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Dot-separated prerelease identifiers, empty for a release version.
    pub prerelease: Vec<String>,
    /// Opaque build tag; ignored by comparison and equality.
    pub build: Option<String>,
}

impl Version {
    /// Parse a version string. A leading `v` is accepted and discarded;
    /// missing minor/patch components default to `0`.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(VersionError::InvalidVersion(input.to_string()));
        }
        let caps = version_re()
            .captures(trimmed)
            .ok_or_else(|| VersionError::InvalidVersion(input.to_string()))?;

        let number = |idx: usize| -> Result<u64, VersionError> {
            match caps.get(idx) {
                Some(m) => m
                    .as_str()
                    .parse::<u64>()
                    .map_err(|_| VersionError::InvalidVersion(input.to_string())),
                None => Ok(0),
            }
        };

        Ok(Self {
            major: number(1)?,
            minor: number(2)?,
            patch: number(3)?,
            prerelease: caps
                .get(4)
                .map(|m| m.as_str().split('.').map(str::to_string).collect())
                .unwrap_or_default(),
            build: caps.get(5).map(|m| m.as_str().to_string()),
        })
    }

    /// A bare `major.minor.patch` release version.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: Vec::new(),
            build: None,
        }
    }

    pub fn is_prerelease(&self) -> bool {
        !self.prerelease.is_empty()
    }

    fn next_major(&self) -> Self {
        Self::new(self.major + 1, 0, 0)
    }

    fn next_minor(&self) -> Self {
        Self::new(self.major, self.minor + 1, 0)
    }

    fn next_patch(&self) -> Self {
        Self::new(self.major, self.minor, self.patch + 1)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.prerelease.is_empty() {
            write!(f, "-{}", self.prerelease.join("."))?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.major.hash(state);
        self.minor.hash(state);
        self.patch.hash(state);
        self.prerelease.hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
            .then_with(|| self.patch.cmp(&other.patch))
            .then_with(|| compare_prerelease(&self.prerelease, &other.prerelease))
    }
}

/// Prerelease precedence: a version with a prerelease sorts below the
/// otherwise-equal release; identifiers compare numerically when both are
/// numeric, numerics sort below alphanumerics, and a longer identifier
/// list wins once the shared prefix is equal.
fn compare_prerelease(a: &[String], b: &[String]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }

    for (x, y) in a.iter().zip(b.iter()) {
        let ord = compare_identifier(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn compare_identifier(a: &str, b: &str) -> Ordering {
    let a_num = numeric_identifier(a);
    let b_num = numeric_identifier(b);
    match (a_num, b_num) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn numeric_identifier(s: &str) -> Option<u64> {
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}

/// A version constraint: one predicate over [`Version`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// Matches any version.
    Latest,
    Exact(Version),
    Greater(Version),
    GreaterEq(Version),
    Less(Version),
    LessEq(Version),
    /// `~V`: at least `V`, below the next minor of `V`.
    Tilde(Version),
    /// `^V`: caret range with the zero-aware major/minor/patch rules.
    Caret(Version),
}

impl Constraint {
    /// Parse a constraint expression. Surrounding whitespace is trimmed;
    /// `latest` is matched case-insensitively; a bare version means exact
    /// equality.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(VersionError::InvalidConstraint(input.to_string()));
        }
        if s.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }

        let (ctor, rest): (fn(Version) -> Self, &str) = if let Some(r) = s.strip_prefix(">=") {
            (Self::GreaterEq, r)
        } else if let Some(r) = s.strip_prefix("<=") {
            (Self::LessEq, r)
        } else if let Some(r) = s.strip_prefix('>') {
            (Self::Greater, r)
        } else if let Some(r) = s.strip_prefix('<') {
            (Self::Less, r)
        } else if let Some(r) = s.strip_prefix('=') {
            (Self::Exact, r)
        } else if let Some(r) = s.strip_prefix('~') {
            (Self::Tilde, r)
        } else if let Some(r) = s.strip_prefix('^') {
            (Self::Caret, r)
        } else {
            (Self::Exact, s)
        };

        let version = Version::parse(rest.trim())
            .map_err(|_| VersionError::InvalidConstraint(input.to_string()))?;
        Ok(ctor(version))
    }

    /// Whether `candidate` satisfies this constraint.
    pub fn matches(&self, candidate: &Version) -> bool {
        match self {
            Self::Latest => true,
            Self::Exact(v) => candidate == v,
            Self::Greater(v) => candidate > v,
            Self::GreaterEq(v) => candidate >= v,
            Self::Less(v) => candidate < v,
            Self::LessEq(v) => candidate <= v,
            Self::Tilde(v) => candidate >= v && *candidate < v.next_minor(),
            Self::Caret(v) => {
                let upper = if v.major != 0 {
                    v.next_major()
                } else if v.minor != 0 {
                    v.next_minor()
                } else {
                    v.next_patch()
                };
                candidate >= v && *candidate < upper
            }
        }
    }
}

impl FromStr for Constraint {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Exact(v) => write!(f, "{v}"),
            Self::Greater(v) => write!(f, ">{v}"),
            Self::GreaterEq(v) => write!(f, ">={v}"),
            Self::Less(v) => write!(f, "<{v}"),
            Self::LessEq(v) => write!(f, "<={v}"),
            Self::Tilde(v) => write!(f, "~{v}"),
            Self::Caret(v) => write!(f, "^{v}"),
        }
    }
}

/// Greatest candidate satisfying `constraint`, or `None`.
pub fn best_match(constraint: &Constraint, candidates: &[Version]) -> Option<Version> {
    candidates
        .iter()
        .filter(|v| constraint.matches(v))
        .max()
        .cloned()
}

/// Greatest candidate string satisfying `constraint`; candidates that fail
/// to parse are skipped, and the winner keeps its original spelling.
pub fn best_match_str<S: AsRef<str>>(constraint: &Constraint, candidates: &[S]) -> Option<String> {
    candidates
        .iter()
        .filter_map(|s| {
            Version::parse(s.as_ref())
                .ok()
                .map(|v| (v, s.as_ref().to_string()))
        })
        .filter(|(v, _)| constraint.matches(v))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, s)| s)
}

/// Sort versions ascending.
pub fn sort_versions(mut versions: Vec<Version>) -> Vec<Version> {
    versions.sort();
    versions
}

/// Sort versions descending.
pub fn sort_versions_desc(mut versions: Vec<Version>) -> Vec<Version> {
    versions.sort_by(|a, b| b.cmp(a));
    versions
}

/// Sort version strings ascending by their parsed value, keeping the
/// original spellings and silently dropping inputs that fail to parse.
pub fn sort_version_strings<S: AsRef<str>>(inputs: &[S]) -> Vec<String> {
    let mut parsed: Vec<(Version, String)> = inputs
        .iter()
        .filter_map(|s| {
            Version::parse(s.as_ref())
                .ok()
                .map(|v| (v, s.as_ref().to_string()))
        })
        .collect();
    parsed.sort_by(|(a, _), (b, _)| a.cmp(b));
    parsed.into_iter().map(|(_, s)| s).collect()
}

/// Descending variant of [`sort_version_strings`].
pub fn sort_version_strings_desc<S: AsRef<str>>(inputs: &[S]) -> Vec<String> {
    let mut sorted = sort_version_strings(inputs);
    sorted.reverse();
    sorted
}
