use std::time::Instant;

use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    core::DynamicObject,
    Client,
};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::debug;

use crate::{strip_managed_fields, ClusterStore, ObjectRef, StoreError};

/// API server backed store over `Api<DynamicObject>`.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Client from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self, StoreError> {
        let client = Client::try_default().await.map_err(|e| StoreError::Api(format!("building kube client: {}", e)))?;
        Ok(Self { client })
    }

    fn api(&self, r: &ObjectRef) -> Api<DynamicObject> {
        let ar = r.kind.api_resource();
        match (&r.namespace, r.kind.namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

enum Verb {
    Create,
    Other,
}

fn map_err(e: kube::Error, r: &ObjectRef, verb: Verb) -> StoreError {
    counter!("store_err", 1u64);
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => StoreError::NotFound(r.to_string()),
            409 if matches!(verb, Verb::Create) || ae.reason == "AlreadyExists" => StoreError::AlreadyExists(r.to_string()),
            409 => StoreError::Conflict(format!("{}: {}", r, ae.message)),
            400 | 422 => StoreError::Invalid(format!("{}: {}", r, ae.message)),
            _ => StoreError::Api(format!("{}: {} ({})", r, ae.message, ae.code)),
        },
        other => StoreError::Api(format!("{}: {}", r, other)),
    }
}

fn to_dynamic(obj: &Value) -> Result<DynamicObject, StoreError> {
    serde_json::from_value(obj.clone()).map_err(|e| StoreError::Invalid(format!("not a kubernetes object: {}", e)))
}

fn to_raw(obj: DynamicObject) -> Result<Value, StoreError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| StoreError::Invalid(format!("serializing DynamicObject: {}", e)))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn observe(op: &'static str, r: &ObjectRef, t0: Instant) {
    histogram!("store_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    debug!(op, object = %r, took_ms = %t0.elapsed().as_millis(), "store call");
}

#[async_trait::async_trait]
impl ClusterStore for KubeStore {
    async fn get(&self, r: &ObjectRef) -> Result<Option<Value>, StoreError> {
        let t0 = Instant::now();
        let found = self.api(r).get_opt(&r.name).await.map_err(|e| map_err(e, r, Verb::Other))?;
        observe("get", r, t0);
        found.map(to_raw).transpose()
    }

    async fn create(&self, r: &ObjectRef, obj: &Value) -> Result<Value, StoreError> {
        let t0 = Instant::now();
        let created = self
            .api(r)
            .create(&PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_err(e, r, Verb::Create))?;
        observe("create", r, t0);
        to_raw(created)
    }

    async fn update(&self, r: &ObjectRef, obj: &Value) -> Result<Value, StoreError> {
        let t0 = Instant::now();
        let updated = self
            .api(r)
            .replace(&r.name, &PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_err(e, r, Verb::Other))?;
        observe("update", r, t0);
        to_raw(updated)
    }

    async fn patch(&self, r: &ObjectRef, merge_patch: &Value) -> Result<Value, StoreError> {
        let t0 = Instant::now();
        let patched = self
            .api(r)
            .patch(&r.name, &PatchParams::default(), &Patch::Merge(merge_patch))
            .await
            .map_err(|e| map_err(e, r, Verb::Other))?;
        observe("patch", r, t0);
        to_raw(patched)
    }

    async fn apply(&self, r: &ObjectRef, obj: &Value, field_manager: &str) -> Result<Value, StoreError> {
        let t0 = Instant::now();
        let pp = PatchParams::apply(field_manager).force();
        let applied = self
            .api(r)
            .patch(&r.name, &pp, &Patch::Apply(obj))
            .await
            .map_err(|e| map_err(e, r, Verb::Other))?;
        observe("apply", r, t0);
        to_raw(applied)
    }
}
