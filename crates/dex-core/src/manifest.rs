//! Minimal typed view of a plugin manifest.
//!
//! The engine only consumes `name`, `version`, and `description`; any
//! other manifest fields belong to outer layers and are ignored here.
//! The native on-disk form is `plugin.toml`; `package.json` is accepted
//! wherever a source carries a JSON manifest (git and Azure package
//! modes, and as a local fallback).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::version::Version;

/// TOML manifest filename looked up at a package root.
pub const MANIFEST_TOML: &str = "plugin.toml";
/// JSON manifest filename looked up at a package root.
pub const MANIFEST_JSON: &str = "package.json";

/// The manifest fields the core reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Manifest {
    /// Load the manifest from a package directory, trying `plugin.toml`
    /// first and falling back to `package.json`.
    pub fn load(dir: &Path) -> Result<Self> {
        let toml_path = dir.join(MANIFEST_TOML);
        if toml_path.exists() {
            let content = std::fs::read_to_string(&toml_path)
                .map_err(|e| config_io(&toml_path, e))?;
            return Self::from_toml(&content, &toml_path.display().to_string());
        }

        let json_path = dir.join(MANIFEST_JSON);
        if json_path.exists() {
            let content = std::fs::read_to_string(&json_path)
                .map_err(|e| config_io(&json_path, e))?;
            return Self::from_json(&content, &json_path.display().to_string());
        }

        Err(Error::NotFound {
            kind: "manifest".to_string(),
            name: dir.display().to_string(),
        })
    }

    /// Parse a TOML manifest, reporting the failing location when known.
    pub fn from_toml(content: &str, file: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(content).map_err(|e| {
            let (line, column) = e
                .span()
                .map(|span| line_col(content, span.start))
                .map_or((None, None), |(l, c)| (Some(l), Some(c)));
            Error::Config {
                file: file.to_string(),
                line,
                column,
                message: e.message().to_string(),
                cause: Some(Box::new(e)),
            }
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a JSON manifest, reporting the failing location when known.
    pub fn from_json(content: &str, file: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(content).map_err(|e| Error::Config {
            file: file.to_string(),
            line: Some(e.line()),
            column: Some(e.column()),
            message: e.to_string(),
            cause: Some(Box::new(e)),
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check the fields the core depends on: a non-empty name and a
    /// semver-parseable version.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation {
                resource: "manifest".to_string(),
                field: "name".to_string(),
                message: "name must not be empty".to_string(),
            });
        }
        if let Err(e) = Version::parse(&self.version) {
            return Err(Error::Validation {
                resource: "manifest".to_string(),
                field: "version".to_string(),
                message: e.to_string(),
            });
        }
        Ok(())
    }
}

fn config_io(path: &Path, e: std::io::Error) -> Error {
    Error::Config {
        file: path.display().to_string(),
        line: None,
        column: None,
        message: e.to_string(),
        cause: Some(Box::new(e)),
    }
}

/// 1-based line and column for a byte offset into `content`.
fn line_col(content: &str, offset: usize) -> (usize, usize) {
    let clamped = offset.min(content.len());
    let prefix = &content[..clamped];
    let line = prefix.matches('\n').count() + 1;
    let column = prefix
        .rfind('\n')
        .map_or(clamped + 1, |nl| clamped - nl);
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_toml() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_TOML),
            "name = \"jq\"\nversion = \"1.7.1\"\ndescription = \"JSON processor\"\n",
        )
        .unwrap();

        let manifest = Manifest::load(dir.path()).unwrap();
        assert_eq!(manifest.name, "jq");
        assert_eq!(manifest.version, "1.7.1");
        assert_eq!(manifest.description.as_deref(), Some("JSON processor"));
    }

    #[test]
    fn test_load_json_fallback() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_JSON),
            r#"{"name":"jq","version":"1.7.1","homepage":"https://jqlang.org"}"#,
        )
        .unwrap();

        let manifest = Manifest::load(dir.path()).unwrap();
        assert_eq!(manifest.name, "jq");
        assert!(manifest.description.is_none());
    }

    #[test]
    fn test_toml_takes_precedence_over_json() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_TOML), "name = \"a\"\nversion = \"1.0.0\"\n")
            .unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_JSON),
            r#"{"name":"b","version":"2.0.0"}"#,
        )
        .unwrap();

        assert_eq!(Manifest::load(dir.path()).unwrap().name, "a");
    }

    #[test]
    fn test_missing_manifest_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Manifest::load(dir.path()),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_bad_toml_reports_config_error() {
        let err = Manifest::from_toml("name = \"a\"\nversion = [1]\n", "plugin.toml").unwrap_err();
        match err {
            Error::Config { file, .. } => assert_eq!(file, "plugin.toml"),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_version_is_validation_error() {
        let err =
            Manifest::from_toml("name = \"a\"\nversion = \"not-semver\"\n", "plugin.toml")
                .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "version"));
    }

    #[test]
    fn test_line_col() {
        let content = "a = 1\nb = 2\nc = 3\n";
        assert_eq!(line_col(content, 0), (1, 1));
        assert_eq!(line_col(content, 6), (2, 1));
        assert_eq!(line_col(content, 8), (2, 3));
    }
}
