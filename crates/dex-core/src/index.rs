//! The `registry.json` document shared by registry-mode sources.
//!
//! Publishing mutates the index through [`RegistryIndex::record`], a
//! read-modify-write protocol with no compare-and-set: concurrent
//! publishers against the same registry can lose updates.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::naming::names_match;

/// Index filename at a registry root (or under its prefix).
pub const REGISTRY_INDEX: &str = "registry.json";

/// Registry name written when creating a fresh index.
pub const DEFAULT_INDEX_NAME: &str = "dex-registry";
/// Index schema version written when creating a fresh index.
pub const DEFAULT_INDEX_VERSION: &str = "1.0";

/// One package's entry in the index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageEntry {
    /// Available versions in insertion order.
    #[serde(default)]
    pub versions: Vec<String>,
    /// Most recently published version; one of `versions` unless the
    /// entry is empty.
    #[serde(default)]
    pub latest: String,
}

/// The whole registry index document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryIndex {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub packages: BTreeMap<String, PackageEntry>,
}

impl Default for RegistryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryIndex {
    /// A fresh, empty index with the default name and schema version.
    pub fn new() -> Self {
        Self {
            name: DEFAULT_INDEX_NAME.to_string(),
            version: DEFAULT_INDEX_VERSION.to_string(),
            packages: BTreeMap::new(),
        }
    }

    /// Parse an index document, attributing failures to `file`.
    pub fn from_json(content: &str, file: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::Config {
            file: file.to_string(),
            line: Some(e.line()),
            column: Some(e.column()),
            message: e.to_string(),
            cause: Some(Box::new(e)),
        })
    }

    /// Read an index document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            file: path.display().to_string(),
            line: None,
            column: None,
            message: e.to_string(),
            cause: Some(Box::new(e)),
        })?;
        Self::from_json(&content, &path.display().to_string())
    }

    /// Serialize with two-space indentation, trailing newline included.
    pub fn to_json_pretty(&self) -> String {
        let mut out = serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string());
        out.push('\n');
        out
    }

    /// Find a package entry by name, comparing with name normalization.
    pub fn find(&self, name: &str) -> Option<(&str, &PackageEntry)> {
        self.packages
            .iter()
            .find(|(key, _)| names_match(key, name))
            .map(|(key, entry)| (key.as_str(), entry))
    }

    /// Package names in index order.
    pub fn package_names(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }

    /// Record a published version: appends to the entry's version list
    /// unless already present, and unconditionally moves `latest`.
    pub fn record(&mut self, name: &str, version: &str) {
        let entry = self.packages.entry(name.to_string()).or_default();
        if !entry.versions.iter().any(|v| v == version) {
            entry.versions.push(version.to_string());
        }
        entry.latest = version.to_string();
    }
}

/// The index update function used by publishers: start from the current
/// index (or a fresh one when the registry has none) and record the
/// published version.
pub fn update_index(current: Option<RegistryIndex>, name: &str, version: &str) -> RegistryIndex {
    let mut index = current.unwrap_or_default();
    index.record(name, version);
    index
}
