//! Keel apply: CRD synchronization. Every CRD a package ships is
//! force-applied (server-side apply) and reported with a minimal diff
//! against the live object.

#![forbid(unsafe_code)]

use std::time::Instant;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use keel_chart::{PackageDescriptor, SchemaManifest};
use keel_kubehub::{ClusterStore, ObjectRef, ResourceKind};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

/// Field manager that owns CRDs after a sync; matches what `kubectl apply --server-side` uses.
pub const FIELD_MANAGER: &str = "kubectl";

const CRD_GROUP: &str = "apiextensions.k8s.io";
const CRD_API_VERSION: &str = "apiextensions.k8s.io/v1";
const CRD_KIND: &str = "CustomResourceDefinition";

fn max_yaml_bytes() -> usize {
    std::env::var("KEEL_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(8_000_000) // ~8 MB; operator CRD bundles are large
}

fn max_yaml_nodes() -> usize {
    std::env::var("KEEL_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Running counter; bail as soon as the budget is reached
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("applying CRD {name}: {reason}")]
    ApplyFailed { name: String, reason: String },
}

fn apply_failed(name: impl Into<String>, reason: impl ToString) -> SyncError {
    SyncError::ApplyFailed { name: name.into(), reason: reason.to_string() }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedCrd {
    pub name: String,
    /// Manifest file inside the package, `<chart>:<path>`.
    pub source: String,
    pub summary: DiffSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub applied: Vec<AppliedCrd>,
    /// Documents that were not `apiextensions.k8s.io/v1` CRDs.
    pub skipped: usize,
}

impl SyncReport {
    /// True when every applied CRD already matched the live object.
    pub fn unchanged(&self) -> bool { self.applied.iter().all(|a| a.summary.is_empty()) }
}

/// A decoded CRD ready to apply.
#[derive(Debug, Clone)]
pub struct CrdDoc {
    pub name: String,
    pub source: String,
    pub body: Json,
}

/// CRDs of `pkg` itself, or with `tag` of the sub-packages whose dependency
/// declaration carries that tag. Returns the CRDs plus the count of skipped
/// documents.
pub fn collect_crds(pkg: &PackageDescriptor, tag: Option<&str>) -> Result<(Vec<CrdDoc>, usize), SyncError> {
    let sources: Vec<&PackageDescriptor> = match tag {
        None => vec![pkg],
        Some(t) => pkg.subpackages_tagged(t),
    };
    let mut docs = Vec::new();
    let mut skipped = 0usize;
    for source in sources {
        for manifest in &source.schemas {
            skipped += decode_manifest(&source.name, manifest, &mut docs)?;
        }
    }
    Ok((docs, skipped))
}

fn decode_manifest(chart: &str, manifest: &SchemaManifest, out: &mut Vec<CrdDoc>) -> Result<usize, SyncError> {
    let source = format!("{}:{}", chart, manifest.path);
    if manifest.data.len() > max_yaml_bytes() {
        return Err(apply_failed(&source, format!("manifest too large (>{} bytes)", max_yaml_bytes())));
    }
    let mut skipped = 0usize;
    for (idx, doc) in serde_yaml::Deserializer::from_str(&manifest.data).enumerate() {
        let json = match serde_yaml::Value::deserialize(doc).map(serde_json::to_value) {
            Ok(Ok(json)) => json,
            Ok(Err(e)) => {
                warn!(source = %source, doc = idx, error = %e, "skipping non-JSON-compatible document");
                skipped += 1;
                continue;
            }
            Err(e) => {
                warn!(source = %source, doc = idx, error = %e, "skipping unparseable document");
                skipped += 1;
                continue;
            }
        };
        if json.is_null() {
            continue;
        }
        let api_version = json.get("apiVersion").and_then(Json::as_str).unwrap_or_default();
        let kind = json.get("kind").and_then(Json::as_str).unwrap_or_default();
        let group = api_version.split_once('/').map(|(g, _)| g).unwrap_or_default();
        if kind != CRD_KIND || group != CRD_GROUP {
            debug!(source = %source, doc = idx, kind, "not a CRD; skipping");
            skipped += 1;
            continue;
        }
        if api_version != CRD_API_VERSION {
            warn!(source = %source, doc = idx, api_version, "CRD apiVersion no longer served; skipping");
            skipped += 1;
            continue;
        }
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(apply_failed(&source, format!("CRD too complex (>{} nodes)", max_yaml_nodes())));
        }
        let crd: CustomResourceDefinition = serde_json::from_value(json).map_err(|e| apply_failed(&source, e))?;
        let name = crd.metadata.name.clone().ok_or_else(|| apply_failed(&source, "missing metadata.name"))?;
        let body = serde_json::to_value(&crd).map_err(|e| apply_failed(&name, e))?;
        out.push(CrdDoc { name, source: source.clone(), body });
    }
    Ok(skipped)
}

/// Force-apply the CRDs selected by `tag` (see [`collect_crds`]). Stops at the first failure.
pub async fn sync(store: &dyn ClusterStore, pkg: &PackageDescriptor, tag: Option<&str>) -> Result<SyncReport, SyncError> {
    let t0 = Instant::now();
    let (docs, skipped) = collect_crds(pkg, tag)?;
    info!(chart = %pkg.name, tag = ?tag, crds = docs.len(), skipped, "syncing CRDs");
    let mut report = SyncReport { applied: Vec::with_capacity(docs.len()), skipped };
    for doc in docs {
        let r = ObjectRef::cluster(ResourceKind::CRD, &doc.name);
        let live = match store.get(&r).await {
            Ok(live) => live,
            Err(e) => {
                counter!("crd_apply_err", 1u64);
                return Err(apply_failed(&doc.name, e));
            }
        };
        let summary = diff_summary(&strip_noisy(doc.body.clone()), &live.map(strip_noisy).unwrap_or(Json::Null));
        if let Err(e) = store.apply(&r, &doc.body, FIELD_MANAGER).await {
            counter!("crd_apply_err", 1u64);
            return Err(apply_failed(&doc.name, e));
        }
        counter!("crd_apply_ok", 1u64);
        info!(crd = %doc.name, adds = summary.adds, updates = summary.updates, removes = summary.removes, "CRD applied");
        report.applied.push(AppliedCrd { name: doc.name, source: doc.source, summary });
    }
    histogram!("crd_sync_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    Ok(report)
}

fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
        }
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            // Scalars differ or type differs
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = serde_json::json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {
                "name": "widgets.example.com",
                "uid": "8c1f",
                "managedFields": [ {"manager": "kubectl"} ],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": { "acceptedNames": { "kind": "Widget" } },
            "spec": { "group": "example.com" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned.get("metadata").unwrap().as_object().unwrap();
        assert_eq!(meta.keys().collect::<Vec<_>>(), vec!["name"]);
        assert!(!pruned.as_object().unwrap().contains_key("status"));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3] });
        let target = serde_json::json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        // a and c[1] updated; b.y and d added; c shrinks by one
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
        assert!(diff_summary(&target, &target).is_empty());
    }

    #[test]
    fn node_budget_trips_on_wide_documents() {
        let wide = serde_json::json!({ "a": [1, 2, 3, 4, 5], "b": { "c": 1 } });
        assert!(json_node_budget_exceeded(&wide, 5));
        assert!(!json_node_budget_exceeded(&wide, 100));
    }
}
