//! Error taxonomy for the dex engine.
//!
//! Component-local failures (archive handling, hashing, version parsing)
//! carry their own error enums and are wrapped into one of these kinds at
//! the component boundary, preserving the inner cause for inspection.

use std::fmt;

use thiserror::Error;

/// Convenience alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed inner cause preserved through a boundary wrap.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Operation that a registry backend was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryOp {
    Fetch,
    Resolve,
    List,
    Connect,
    Parse,
}

impl fmt::Display for RegistryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fetch => "fetch",
            Self::Resolve => "resolve",
            Self::List => "list",
            Self::Connect => "connect",
            Self::Parse => "parse",
        };
        f.write_str(s)
    }
}

/// Phase of an install (resolve→fetch→extract) pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    Fetch,
    Parse,
    Validate,
    Install,
    Merge,
    Verify,
    Extract,
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fetch => "fetch",
            Self::Parse => "parse",
            Self::Validate => "validate",
            Self::Install => "install",
            Self::Merge => "merge",
            Self::Verify => "verify",
            Self::Extract => "extract",
        };
        f.write_str(s)
    }
}

/// Phase of a packing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackPhase {
    Read,
    Validate,
    Compress,
}

impl fmt::Display for PackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Validate => "validate",
            Self::Compress => "compress",
        };
        f.write_str(s)
    }
}

/// Phase of a publish run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPhase {
    Connect,
    Validate,
    Upload,
    Index,
}

impl fmt::Display for PublishPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Validate => "validate",
            Self::Upload => "upload",
            Self::Index => "index",
        };
        f.write_str(s)
    }
}

/// Top-level error kinds surfaced by the engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Manifest or index parsing problem, with location when known.
    #[error("config error in {file}{}: {message}", location(.line, .column))]
    Config {
        file: String,
        line: Option<usize>,
        column: Option<usize>,
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    /// Transport-layer failure against a registry source.
    #[error("registry {op} failed for {url}")]
    Registry {
        url: String,
        op: RegistryOp,
        #[source]
        cause: Option<Cause>,
    },

    /// Failure in the fetch/verify/extract half of an install.
    #[error("install of {plugin} failed during {phase}")]
    Install {
        plugin: String,
        phase: InstallPhase,
        #[source]
        cause: Option<Cause>,
    },

    /// A field-level validation failure on some resource.
    #[error("validation failed for {resource}: {field}: {message}")]
    Validation {
        resource: String,
        field: String,
        message: String,
    },

    /// A named thing does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    /// No available version satisfies the requested constraint.
    #[error("no version of {plugin} satisfies {constraint} (available: {})", format_available(.available))]
    Version {
        plugin: String,
        constraint: String,
        available: Vec<String>,
        message: Option<String>,
    },

    /// Failure while packing a directory into a tarball.
    #[error("packing {directory} failed during {phase}")]
    Pack {
        directory: String,
        phase: PackPhase,
        #[source]
        cause: Option<Cause>,
    },

    /// Failure while publishing a tarball to a registry.
    #[error("publish to {url} failed during {phase}")]
    Publish {
        plugin: Option<String>,
        url: String,
        phase: PublishPhase,
        #[source]
        cause: Option<Cause>,
    },
}

fn location(line: &Option<usize>, column: &Option<usize>) -> String {
    match (line, column) {
        (Some(l), Some(c)) => format!(":{l}:{c}"),
        (Some(l), None) => format!(":{l}"),
        _ => String::new(),
    }
}

fn format_available(available: &[String]) -> String {
    if available.is_empty() {
        "none".to_string()
    } else {
        available.join(", ")
    }
}

impl Error {
    /// Registry failure with a preserved cause.
    pub fn registry(
        url: impl Into<String>,
        op: RegistryOp,
        cause: impl Into<Cause>,
    ) -> Self {
        Self::Registry {
            url: url.into(),
            op,
            cause: Some(cause.into()),
        }
    }

    /// Registry failure carrying only a message.
    pub fn registry_msg(url: impl Into<String>, op: RegistryOp, message: impl Into<String>) -> Self {
        Self::Registry {
            url: url.into(),
            op,
            cause: Some(message.into().into()),
        }
    }

    /// Install failure with a preserved cause.
    pub fn install(
        plugin: impl Into<String>,
        phase: InstallPhase,
        cause: impl Into<Cause>,
    ) -> Self {
        Self::Install {
            plugin: plugin.into(),
            phase,
            cause: Some(cause.into()),
        }
    }

    /// Pack failure with a preserved cause.
    pub fn pack(
        directory: impl Into<String>,
        phase: PackPhase,
        cause: impl Into<Cause>,
    ) -> Self {
        Self::Pack {
            directory: directory.into(),
            phase,
            cause: Some(cause.into()),
        }
    }

    /// Publish failure with a preserved cause.
    pub fn publish(
        plugin: Option<String>,
        url: impl Into<String>,
        phase: PublishPhase,
        cause: impl Into<Cause>,
    ) -> Self {
        Self::Publish {
            plugin,
            url: url.into(),
            phase,
            cause: Some(cause.into()),
        }
    }

    /// Not-found for a package, the most common kind.
    pub fn package_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "package".to_string(),
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The registry operation that failed, for `Registry` errors.
    pub fn registry_op(&self) -> Option<RegistryOp> {
        match self {
            Self::Registry { op, .. } => Some(*op),
            _ => None,
        }
    }

    /// The install phase that failed, for `Install` errors.
    pub fn install_phase(&self) -> Option<InstallPhase> {
        match self {
            Self::Install { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// The pack phase that failed, for `Pack` errors.
    pub fn pack_phase(&self) -> Option<PackPhase> {
        match self {
            Self::Pack { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// The publish phase that failed, for `Publish` errors.
    pub fn publish_phase(&self) -> Option<PublishPhase> {
        match self {
            Self::Publish { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}
