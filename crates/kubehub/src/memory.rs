//! In-process store with API server like semantics: resourceVersion checks
//! on update, JSON merge patch, forced apply that only bumps the version
//! when content changes. Records every call for inspection.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::{Map, Value};

use crate::{ClusterStore, ObjectRef, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Get(String),
    Create(String),
    Update(String),
    Patch(String),
    Apply { object: String, manager: String, changed: bool },
}

type Key = (String, Option<String>, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    last_rv: u64,
    journal: Vec<StoreCall>,
    reject_apply: Option<String>,
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.last_rv += 1;
        self.last_rv.to_string()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn key(r: &ObjectRef) -> Key { (r.kind.gvk_key(), r.namespace.clone(), r.name.clone()) }

fn metadata_mut(obj: &mut Value) -> Option<&mut Map<String, Value>> {
    let root = obj.as_object_mut()?;
    let meta = root.entry("metadata").or_insert_with(|| Value::Object(Map::new()));
    meta.as_object_mut()
}

fn resource_version(obj: &Value) -> Option<&str> { obj.pointer("/metadata/resourceVersion").and_then(Value::as_str) }

/// Fill in identity fields and set the resourceVersion.
fn stamp(r: &ObjectRef, obj: &mut Value, rv: String) -> Result<(), StoreError> {
    let kind = r.kind;
    let root = obj.as_object_mut().ok_or_else(|| StoreError::Invalid(format!("{}: object must be a mapping", r)))?;
    root.entry("apiVersion").or_insert_with(|| Value::String(kind.api_version()));
    root.entry("kind").or_insert_with(|| Value::String(kind.kind.to_string()));
    let meta = metadata_mut(obj).ok_or_else(|| StoreError::Invalid(format!("{}: metadata must be a mapping", r)))?;
    meta.insert("name".into(), Value::String(r.name.clone()));
    if let Some(ns) = &r.namespace {
        meta.insert("namespace".into(), Value::String(ns.clone()));
    }
    meta.insert("resourceVersion".into(), Value::String(rv));
    Ok(())
}

/// RFC 7386 JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(t) = target {
        for (k, v) in patch {
            if v.is_null() {
                t.shift_remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

/// Copy without server-populated metadata, for change detection.
fn content(obj: &Value) -> Value {
    let mut v = obj.clone();
    if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("resourceVersion");
        meta.remove("managedFields");
    }
    v
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Insert or overwrite an object without recording a call.
    pub fn seed(&self, r: &ObjectRef, mut obj: Value) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let rv = inner.next_rv();
        stamp(r, &mut obj, rv)?;
        inner.objects.insert(key(r), obj);
        Ok(())
    }

    pub fn object(&self, r: &ObjectRef) -> Option<Value> { self.lock().objects.get(&key(r)).cloned() }

    pub fn calls(&self) -> Vec<StoreCall> { self.lock().journal.clone() }

    /// Make every following `apply` fail with `StoreError::Api(reason)`.
    pub fn reject_apply(&self, reason: &str) { self.lock().reject_apply = Some(reason.to_string()); }

    /// Simulate another writer: bump the stored resourceVersion.
    pub fn touch(&self, r: &ObjectRef) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let rv = inner.next_rv();
        let obj = inner.objects.get_mut(&key(r)).ok_or_else(|| StoreError::NotFound(r.to_string()))?;
        stamp(r, obj, rv)
    }
}

#[async_trait::async_trait]
impl ClusterStore for MemoryStore {
    async fn get(&self, r: &ObjectRef) -> Result<Option<Value>, StoreError> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::Get(r.to_string()));
        Ok(inner.objects.get(&key(r)).cloned())
    }

    async fn create(&self, r: &ObjectRef, obj: &Value) -> Result<Value, StoreError> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::Create(r.to_string()));
        if inner.objects.contains_key(&key(r)) {
            return Err(StoreError::AlreadyExists(r.to_string()));
        }
        let mut obj = obj.clone();
        let rv = inner.next_rv();
        stamp(r, &mut obj, rv)?;
        inner.objects.insert(key(r), obj.clone());
        Ok(obj)
    }

    async fn update(&self, r: &ObjectRef, obj: &Value) -> Result<Value, StoreError> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::Update(r.to_string()));
        let current = inner.objects.get(&key(r)).ok_or_else(|| StoreError::NotFound(r.to_string()))?;
        if let Some(sent) = resource_version(obj) {
            if Some(sent) != resource_version(current) {
                return Err(StoreError::Conflict(format!(
                    "{}: resourceVersion {} is stale (current {})",
                    r,
                    sent,
                    resource_version(current).unwrap_or_default()
                )));
            }
        }
        let mut obj = obj.clone();
        let rv = inner.next_rv();
        stamp(r, &mut obj, rv)?;
        inner.objects.insert(key(r), obj.clone());
        Ok(obj)
    }

    async fn patch(&self, r: &ObjectRef, patch: &Value) -> Result<Value, StoreError> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::Patch(r.to_string()));
        let rv = inner.next_rv();
        let obj = inner.objects.get_mut(&key(r)).ok_or_else(|| StoreError::NotFound(r.to_string()))?;
        merge_patch(obj, patch);
        stamp(r, obj, rv)?;
        Ok(obj.clone())
    }

    async fn apply(&self, r: &ObjectRef, obj: &Value, field_manager: &str) -> Result<Value, StoreError> {
        let mut inner = self.lock();
        if let Some(reason) = inner.reject_apply.clone() {
            inner.journal.push(StoreCall::Apply { object: r.to_string(), manager: field_manager.to_string(), changed: false });
            return Err(StoreError::Api(format!("{}: {}", r, reason)));
        }
        let mut next = obj.clone();
        let existing = inner.objects.get(&key(r)).cloned();
        let current_rv = existing.as_ref().and_then(resource_version).map(str::to_string);
        if let Some(status) = existing.as_ref().and_then(|e| e.get("status")) {
            if let Some(root) = next.as_object_mut() {
                root.entry("status").or_insert_with(|| status.clone());
            }
        }
        let compare_rv = current_rv.clone().unwrap_or_default();
        stamp(r, &mut next, compare_rv)?;
        let changed = existing.as_ref().map(|e| content(e) != content(&next)).unwrap_or(true);
        inner.journal.push(StoreCall::Apply { object: r.to_string(), manager: field_manager.to_string(), changed });
        if !changed {
            return Ok(existing.unwrap_or(next));
        }
        let rv = inner.next_rv();
        stamp(r, &mut next, rv)?;
        inner.objects.insert(key(r), next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceKind;
    use serde_json::json;

    fn plan() -> ObjectRef { ObjectRef::cluster(ResourceKind::INSTALL_PLAN, "devops") }

    #[tokio::test]
    async fn update_rejects_stale_resource_version() {
        let store = MemoryStore::new();
        store.seed(&plan(), json!({ "spec": { "config": "a: 1" } })).unwrap();
        let read = store.get(&plan()).await.unwrap().unwrap();
        store.touch(&plan()).unwrap();
        let err = store.update(&plan(), &read).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "err={}", err);

        let fresh = store.get(&plan()).await.unwrap().unwrap();
        let updated = store.update(&plan(), &fresh).await.unwrap();
        assert_ne!(resource_version(&updated), resource_version(&fresh));
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let store = MemoryStore::new();
        store.create(&plan(), &json!({ "spec": {} })).await.unwrap();
        let err = store.create(&plan(), &json!({ "spec": {} })).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists("InstallPlan devops".into()));
    }

    #[tokio::test]
    async fn merge_patch_sets_and_deletes() {
        let store = MemoryStore::new();
        store.seed(&plan(), json!({ "spec": { "config": "a: 1", "enabled": true } })).unwrap();
        let out = store.patch(&plan(), &json!({ "spec": { "config": "b: 2", "enabled": null } })).await.unwrap();
        assert_eq!(out["spec"], json!({ "config": "b: 2" }));
        assert!(matches!(store.patch(&ObjectRef::cluster(ResourceKind::INSTALL_PLAN, "nope"), &json!({})).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn apply_only_changes_on_new_content() {
        let store = MemoryStore::new();
        let crd = ObjectRef::cluster(ResourceKind::CRD, "widgets.example.com");
        let body = json!({ "apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition", "metadata": { "name": "widgets.example.com" }, "spec": { "group": "example.com" } });
        store.apply(&crd, &body, "kubectl").await.unwrap();
        store.apply(&crd, &body, "kubectl").await.unwrap();
        let changed: Vec<bool> = store
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::Apply { changed, .. } => Some(changed),
                _ => None,
            })
            .collect();
        assert_eq!(changed, vec![true, false]);
    }
}
