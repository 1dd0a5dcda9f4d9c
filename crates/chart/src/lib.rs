//! Keel chart: packaged extensions (Helm chart archives) as descriptors.
//!
//! A descriptor carries the chart metadata, its declared dependencies with
//! their tags, the CRD manifests shipped under `crds/`, the default value
//! tree and the sub-packages bundled under `charts/`. The config merger in
//! [`merge`] reconciles a stored instance config against a descriptor.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;

use keel_core::{coalesce, merge_tree, parse_yaml};

mod archive;
pub mod merge;

pub use archive::pack;
pub use merge::{merge, merge_values, MergeError};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("malformed package: {0}")]
    Malformed(String),
}

impl LoadError {
    pub(crate) fn malformed(reason: impl ToString) -> Self { LoadError::Malformed(reason.to_string()) }
}

/// One entry of `dependencies` in `Chart.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub tags: SmallVec<[String; 2]>,
}

impl Dependency {
    /// Key under which the sub-package's values live in the parent tree.
    pub fn local_name(&self) -> &str { self.alias.as_deref().filter(|a| !a.is_empty()).unwrap_or(&self.name) }

    pub fn has_tag(&self, tag: &str) -> bool { self.tags.iter().any(|t| t == tag) }
}

/// A CRD manifest file bundled under `crds/`; may hold several YAML documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaManifest {
    pub path: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    pub app_version: Option<String>,
    pub dependencies: Vec<Dependency>,
    pub schemas: Vec<SchemaManifest>,
    /// Effective defaults: `values.yaml`, with the load overlay applied at the top level.
    pub defaults: Value,
    pub subpackages: Vec<PackageDescriptor>,
}

impl PackageDescriptor {
    /// Parse a gzipped chart archive. When `overlay` is given (YAML text) it is
    /// layered over the package defaults; `null` entries stay as explicit nulls.
    pub fn load(bytes: &[u8], overlay: Option<&str>) -> Result<Self, LoadError> {
        let mut pkg = archive::read(bytes)?;
        if let Some(text) = overlay {
            let overlay = parse_yaml(text).map_err(|e| LoadError::malformed(format!("overlay: {}", e)))?;
            pkg.defaults = merge_tree(&pkg.defaults, &overlay);
        }
        tracing::debug!(
            chart = %pkg.name,
            version = %pkg.version,
            deps = pkg.dependencies.len(),
            subpackages = pkg.subpackages.len(),
            crd_files = pkg.schemas.len(),
            "package loaded"
        );
        Ok(pkg)
    }

    /// Dependency declaration that bundles `sub`, matched by chart name.
    pub fn dependency_for(&self, sub: &PackageDescriptor) -> Option<&Dependency> { self.dependencies.iter().find(|d| d.name == sub.name) }

    /// Sub-packages whose dependency declaration carries `tag`.
    pub fn subpackages_tagged(&self, tag: &str) -> Vec<&PackageDescriptor> {
        self.subpackages
            .iter()
            .filter(|sub| self.dependency_for(sub).map(|d| d.has_tag(tag)).unwrap_or(false))
            .collect()
    }

    /// Values as a release would see them: own defaults, with each
    /// sub-package's coalesced values under its local name (parent entries
    /// win) and the parent's `global` block pushed down.
    pub fn coalesced_values(&self) -> Value {
        let mut out = match &self.defaults {
            Value::Object(m) => m.clone(),
            _ => Map::new(),
        };
        let globals = out.get("global").cloned();
        for sub in &self.subpackages {
            let key = self.dependency_for(sub).map(|d| d.local_name().to_string()).unwrap_or_else(|| sub.name.clone());
            let parent_entry = out.get(&key).cloned().unwrap_or_else(|| Value::Object(Map::new()));
            let mut merged = coalesce(&sub.coalesced_values(), &parent_entry);
            if let (Some(g), Value::Object(m)) = (&globals, &mut merged) {
                let sub_globals = m.get("global").cloned().unwrap_or_else(|| Value::Object(Map::new()));
                m.insert("global".into(), coalesce(&sub_globals, g));
            }
            out.insert(key, merged);
        }
        Value::Object(out)
    }

    /// Values-only copy with no dependencies or sub-packages, so no nested
    /// defaults reach a merge.
    pub fn mergeable_view(&self) -> PackageDescriptor {
        PackageDescriptor {
            name: self.name.clone(),
            version: self.version.clone(),
            app_version: self.app_version.clone(),
            dependencies: Vec::new(),
            schemas: Vec::new(),
            defaults: self.defaults.clone(),
            subpackages: Vec::new(),
        }
    }
}
