//! Package descriptors and the ordered package catalog.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path};

use super::error::CatalogError;

/// Static configuration for one package.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackageDetails {
    /// Source location (git URL or local path) passed to `git clone`.
    pub source: String,

    /// Dependency manifest inside the source tree (`pip install -r`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,

    /// Test files removed from the fetched tree before either build.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_tests: Vec<String>,

    /// Import name probed after install (defaults to the package identifier).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Known incompatibility; the package is never run while this is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

/// A package identifier plus its static configuration.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PackageDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub details: PackageDetails,
}

impl PackageDescriptor {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            details: PackageDetails {
                source: source.into(),
                ..PackageDetails::default()
            },
        }
    }

    pub fn with_requirements(mut self, file: impl Into<String>) -> Self {
        self.details.requirements = Some(file.into());
        self
    }

    pub fn excluding(mut self, test_path: impl Into<String>) -> Self {
        self.details.excluded_tests.push(test_path.into());
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.details.module = Some(module.into());
        self
    }

    pub fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.details.skip_reason = Some(reason.into());
        self
    }

    /// Import name used by the install marker probe.
    pub fn module_name(&self) -> &str {
        self.details.module.as_deref().unwrap_or(&self.name)
    }

    /// Check the descriptor is safe to turn into shell commands.
    pub fn validate(&self) -> Result<(), CatalogError> {
        let name_ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !name_ok || self.name.starts_with('.') {
            return Err(CatalogError::InvalidName(self.name.clone()));
        }
        if self.details.source.trim().is_empty() {
            return Err(CatalogError::MissingSource {
                package: self.name.clone(),
            });
        }
        let paths = self
            .details
            .excluded_tests
            .iter()
            .chain(self.details.requirements.iter());
        for path in paths {
            if !is_contained_relative(path) {
                return Err(CatalogError::InvalidPath {
                    package: self.name.clone(),
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }
}

fn is_contained_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    packages: BTreeMap<String, PackageDetails>,
}

/// Ordered package catalog. Iteration order is identifier order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageCatalog {
    packages: BTreeMap<String, PackageDetails>,
}

impl PackageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default catalog of pure-Python packages with pytest suites.
    pub fn builtin() -> Self {
        Self::from_descriptors([
            PackageDescriptor::new("chardet", "https://github.com/chardet/chardet.git"),
            PackageDescriptor::new("colorama", "https://github.com/tartley/colorama.git")
                .with_requirements("requirements-dev.txt"),
            PackageDescriptor::new("dateutil", "https://github.com/dateutil/dateutil.git")
                .with_requirements("requirements-dev.txt"),
            PackageDescriptor::new("idna", "https://github.com/kjd/idna.git"),
            PackageDescriptor::new("jmespath", "https://github.com/jmespath/jmespath.py.git")
                .with_requirements("requirements.txt"),
            PackageDescriptor::new("pyasn1", "https://github.com/etingof/pyasn1.git")
                .with_requirements("requirements.txt"),
            PackageDescriptor::new("pyyaml", "https://github.com/yaml/pyyaml.git")
                .with_module("yaml")
                .skipped("setup.py does not support the optimized build command"),
            PackageDescriptor::new("requests", "https://github.com/kennethreitz/requests.git"),
            PackageDescriptor::new("rsa", "https://github.com/sybrenstuvel/python-rsa.git"),
            PackageDescriptor::new("urllib3", "https://github.com/urllib3/urllib3.git")
                .with_requirements("dev-requirements.txt")
                .excluding("test/test_no_ssl.py"),
        ])
    }

    /// Build a catalog from descriptors (a later duplicate replaces an earlier one).
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = PackageDescriptor>) -> Self {
        Self {
            packages: descriptors
                .into_iter()
                .map(|d| (d.name, d.details))
                .collect(),
        }
    }

    /// Parse a JSON catalog: `{"packages": {"<name>": {"source": ...}}}`.
    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;
        let catalog = Self {
            packages: file.packages,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load and validate a JSON catalog file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String, CatalogError> {
        Ok(serde_json::to_string_pretty(&CatalogFile {
            packages: self.packages.clone(),
        })?)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        self.iter().try_for_each(|d| d.validate())
    }

    /// Descriptors in processing order.
    pub fn iter(&self) -> impl Iterator<Item = PackageDescriptor> + '_ {
        self.packages.iter().map(|(name, details)| PackageDescriptor {
            name: name.clone(),
            details: details.clone(),
        })
    }

    pub fn get(&self, name: &str) -> Option<PackageDescriptor> {
        self.packages.get(name).map(|details| PackageDescriptor {
            name: name.to_string(),
            details: details.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Packages excluded by policy, with their reasons.
    pub fn skip_policy(&self) -> BTreeMap<String, String> {
        self.packages
            .iter()
            .filter_map(|(name, d)| d.skip_reason.clone().map(|r| (name.clone(), r)))
            .collect()
    }

    /// SHA-256 of the canonical catalog content (hex).
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, details) in &self.packages {
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            // BTreeMap-backed and derive-ordered, so serialization is canonical.
            let json = serde_json::to_vec(details).unwrap_or_default();
            hasher.update(&json);
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }
}
