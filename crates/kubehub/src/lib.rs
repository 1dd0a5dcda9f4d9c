//! Keel kubehub: access to the cluster records the hook reads and writes.
//!
//! Objects travel as raw JSON (`serde_json::Value`) addressed by an
//! [`ObjectRef`]; typed accessors for the extension records live in
//! [`records`]. [`KubeStore`] talks to the API server, [`MemoryStore`]
//! keeps everything in process.

#![forbid(unsafe_code)]

use std::fmt;

use kube::core::{ApiResource, GroupVersionKind};
use serde_json::Value;

mod kube_store;
mod memory;
pub mod records;

pub use kube_store::KubeStore;
pub use memory::{MemoryStore, StoreCall};
pub use records::{annotate, ChartDataRef, Extension, ExtensionVersion, InstallPlan};

/// Statically known resource types; no discovery round trip needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
    pub namespaced: bool,
}

impl ResourceKind {
    pub const INSTALL_PLAN: Self = Self::cluster("kubesphere.io", "v1alpha1", "InstallPlan", "installplans");
    pub const EXTENSION: Self = Self::cluster("kubesphere.io", "v1alpha1", "Extension", "extensions");
    pub const EXTENSION_VERSION: Self = Self::cluster("kubesphere.io", "v1alpha1", "ExtensionVersion", "extensionversions");
    pub const CONFIG_MAP: Self = Self { group: "", version: "v1", kind: "ConfigMap", plural: "configmaps", namespaced: true };
    pub const CRD: Self = Self::cluster("apiextensions.k8s.io", "v1", "CustomResourceDefinition", "customresourcedefinitions");
    pub const GLOBAL_ROLE: Self = Self::cluster("iam.kubesphere.io", "v1beta1", "GlobalRole", "globalroles");
    pub const GLOBAL_ROLE_BINDING: Self = Self::cluster("iam.kubesphere.io", "v1beta1", "GlobalRoleBinding", "globalrolebindings");
    pub const ROLE_TEMPLATE: Self = Self::cluster("iam.kubesphere.io", "v1beta1", "RoleTemplate", "roletemplates");

    const fn cluster(group: &'static str, version: &'static str, kind: &'static str, plural: &'static str) -> Self {
        Self { group, version, kind, plural, namespaced: false }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// `v1/Kind` or `group/v1/Kind`.
    pub fn gvk_key(&self) -> String { format!("{}/{}", self.api_version(), self.kind) }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(self.group, self.version, self.kind), self.plural)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn cluster(kind: ResourceKind, name: impl Into<String>) -> Self { Self { kind, namespace: None, name: name.into() } }

    pub fn namespaced(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: Some(namespace.into()), name: name.into() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    /// Update raced another writer (stale resourceVersion).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("api: {0}")]
    Api(String),
}

/// Cluster record operations used by the hook. Implementations must be
/// usable from one task at a time; no internal retries.
#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get(&self, r: &ObjectRef) -> Result<Option<Value>, StoreError>;
    async fn create(&self, r: &ObjectRef, obj: &Value) -> Result<Value, StoreError>;
    /// Replace; rejected with `Conflict` when `metadata.resourceVersion` is stale.
    async fn update(&self, r: &ObjectRef, obj: &Value) -> Result<Value, StoreError>;
    /// JSON merge patch (RFC 7386).
    async fn patch(&self, r: &ObjectRef, merge_patch: &Value) -> Result<Value, StoreError>;
    /// Server-side apply with forced ownership for `field_manager`.
    async fn apply(&self, r: &ObjectRef, obj: &Value, field_manager: &str) -> Result<Value, StoreError>;
}

pub(crate) fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_render_api_versions_and_keys() {
        assert_eq!(ResourceKind::CONFIG_MAP.gvk_key(), "v1/ConfigMap");
        assert_eq!(ResourceKind::INSTALL_PLAN.gvk_key(), "kubesphere.io/v1alpha1/InstallPlan");
        let ar = ResourceKind::ROLE_TEMPLATE.api_resource();
        assert_eq!(ar.api_version, "iam.kubesphere.io/v1beta1");
        assert_eq!(ar.plural, "roletemplates");
    }

    #[test]
    fn object_refs_display_scope() {
        assert_eq!(ObjectRef::cluster(ResourceKind::INSTALL_PLAN, "devops").to_string(), "InstallPlan devops");
        let cm = ObjectRef::namespaced(ResourceKind::CONFIG_MAP, "kubesphere-system", "extension-upgrade-config");
        assert_eq!(cm.to_string(), "ConfigMap kubesphere-system/extension-upgrade-config");
    }
}
