//! Typed views over the extension records (`kubesphere.io/v1alpha1`).
//!
//! Each view wraps the raw object so fields this crate does not model
//! survive a read-modify-write round trip untouched.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{ObjectRef, ResourceKind};

fn str_at<'a>(raw: &'a Value, pointer: &str) -> &'a str { raw.pointer(pointer).and_then(Value::as_str).unwrap_or_default() }

fn as_map(v: &mut Value) -> &mut Map<String, Value> {
    if !v.is_object() {
        *v = Value::Object(Map::new());
    }
    match v {
        Value::Object(m) => m,
        _ => unreachable!("replaced with a mapping above"),
    }
}

fn object_at<'a>(raw: &'a mut Value, keys: &[&str]) -> &'a mut Map<String, Value> {
    let mut cur = as_map(raw);
    for key in keys {
        cur = as_map(cur.entry(key.to_string()).or_insert_with(|| Value::Object(Map::new())));
    }
    cur
}

/// Set `metadata.annotations[key]` on a raw object. Returns false when it already had that value.
pub fn annotate(obj: &mut Value, key: &str, value: &str) -> bool {
    let annotations = object_at(obj, &["metadata", "annotations"]);
    if annotations.get(key).and_then(Value::as_str) == Some(value) {
        return false;
    }
    annotations.insert(key.into(), Value::String(value.into()));
    true
}

/// Install intent for one extension: desired version in `spec`, observed in `status`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallPlan {
    raw: Value,
}

impl InstallPlan {
    pub const CREATOR_ANNOTATION: &'static str = "kubesphere.io/creator";

    pub fn object_ref(name: &str) -> ObjectRef { ObjectRef::cluster(ResourceKind::INSTALL_PLAN, name) }

    pub fn from_raw(raw: Value) -> Self { Self { raw } }

    /// New plan named after the extension it installs.
    pub fn new(extension: &str, version: &str, config: &str) -> Self {
        let kind = ResourceKind::INSTALL_PLAN;
        Self::from_raw(json!({
            "apiVersion": kind.api_version(),
            "kind": kind.kind,
            "metadata": { "name": extension },
            "spec": {
                "extension": { "name": extension, "version": version },
                "config": config,
            }
        }))
    }

    pub fn name(&self) -> &str { str_at(&self.raw, "/metadata/name") }
    pub fn desired_version(&self) -> &str { str_at(&self.raw, "/spec/extension/version") }
    pub fn observed_version(&self) -> &str { str_at(&self.raw, "/status/version") }
    pub fn state(&self) -> &str { str_at(&self.raw, "/status/state") }
    pub fn config(&self) -> &str { str_at(&self.raw, "/spec/config") }
    pub fn cluster_scheduling(&self) -> Option<&Value> { self.raw.pointer("/spec/clusterScheduling").filter(|v| !v.is_null()) }

    pub fn resource_version(&self) -> Option<&str> { self.raw.pointer("/metadata/resourceVersion").and_then(Value::as_str) }

    /// Desired version set and different from the observed one.
    pub fn is_version_change(&self) -> bool { !self.desired_version().is_empty() && self.desired_version() != self.observed_version() }

    pub fn set_config(&mut self, text: impl Into<String>) { object_at(&mut self.raw, &["spec"]).insert("config".into(), Value::String(text.into())); }

    pub fn set_cluster_scheduling(&mut self, scheduling: Value) {
        object_at(&mut self.raw, &["spec"]).insert("clusterScheduling".into(), scheduling);
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) { annotate(&mut self.raw, key, value); }

    pub fn raw(&self) -> &Value { &self.raw }
    pub fn into_raw(self) -> Value { self.raw }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extension {
    raw: Value,
}

impl Extension {
    pub fn object_ref(name: &str) -> ObjectRef { ObjectRef::cluster(ResourceKind::EXTENSION, name) }
    pub fn from_raw(raw: Value) -> Self { Self { raw } }
    pub fn name(&self) -> &str { str_at(&self.raw, "/metadata/name") }
    pub fn state(&self) -> &str { str_at(&self.raw, "/status/state") }
    pub fn recommended_version(&self) -> &str { str_at(&self.raw, "/status/recommendedVersion") }
}

/// Where an extension version's chart bytes live inside a ConfigMap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartDataRef {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub key: String,
}

/// One published version of an extension, named `<extension>-<version>`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionVersion {
    raw: Value,
}

impl ExtensionVersion {
    pub fn name_for(extension: &str, version: &str) -> String { format!("{}-{}", extension, version) }

    pub fn object_ref(extension: &str, version: &str) -> ObjectRef {
        ObjectRef::cluster(ResourceKind::EXTENSION_VERSION, Self::name_for(extension, version))
    }

    pub fn from_raw(raw: Value) -> Self { Self { raw } }

    pub fn chart_url(&self) -> Option<&str> {
        self.raw.pointer("/spec/chartURL").and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn chart_data_ref(&self) -> Option<ChartDataRef> {
        let v = self.raw.pointer("/spec/chartDataRef")?;
        serde_json::from_value(v.clone()).ok()
    }
}
