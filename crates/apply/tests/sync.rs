use keel_apply::{collect_crds, sync, SyncError, FIELD_MANAGER};
use keel_chart::{pack, PackageDescriptor};
use keel_kubehub::{ClusterStore, MemoryStore, ObjectRef, ResourceKind, StoreCall};

fn crd(plural: &str, group: &str) -> String {
    format!(
        r#"apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: {plural}.{group}
spec:
  group: {group}
  names:
    kind: Thing
    plural: {plural}
  scope: Namespaced
  versions:
    - name: v1
      served: true
      storage: true
      schema:
        openAPIV3Schema:
          type: object
          x-kubernetes-preserve-unknown-fields: true
"#
    )
}

fn package() -> PackageDescriptor {
    let root_crds = format!("{}---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: not-a-crd\n", crd("widgets", "example.com"));
    let files = vec![
        ("mon/Chart.yaml".to_string(), "name: mon\nversion: 1.2.0\ndependencies:\n  - name: server\n    tags: [extension]\n  - name: agent\n    tags: [agent]\n".to_string()),
        ("mon/crds/widgets.yaml".to_string(), root_crds),
        ("mon/charts/server/Chart.yaml".to_string(), "name: server\nversion: 1.2.0\n".to_string()),
        ("mon/charts/server/crds/rules.yaml".to_string(), crd("rules", "monitoring.example.com")),
        ("mon/charts/agent/Chart.yaml".to_string(), "name: agent\nversion: 1.2.0\n".to_string()),
        ("mon/charts/agent/crds/probes.yaml".to_string(), format!("{}---\n{}", crd("probes", "monitoring.example.com"), crd("scrapes", "monitoring.example.com"))),
        (
            "mon/charts/agent/crds/legacy.yaml".to_string(),
            "apiVersion: apiextensions.k8s.io/v1beta1\nkind: CustomResourceDefinition\nmetadata:\n  name: old.example.com\n".to_string(),
        ),
    ];
    PackageDescriptor::load(&pack(&files).unwrap(), None).unwrap()
}

fn applied_names(store: &MemoryStore) -> Vec<String> {
    store
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            StoreCall::Apply { object, manager, .. } => {
                assert_eq!(manager, FIELD_MANAGER);
                Some(object)
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn unfiltered_sync_applies_root_crds_and_skips_other_kinds() {
    let store = MemoryStore::new();
    let report = sync(&store, &package(), None).await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].name, "widgets.example.com");
    assert_eq!(report.applied[0].source, "mon:crds/widgets.yaml");
    assert_eq!(report.skipped, 1);
    assert!(store.object(&ObjectRef::cluster(ResourceKind::CRD, "widgets.example.com")).is_some());
}

#[tokio::test]
async fn tag_filter_selects_matching_subpackages_only() {
    let store = MemoryStore::new();
    let report = sync(&store, &package(), Some("agent")).await.unwrap();
    let names: Vec<_> = report.applied.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["probes.monitoring.example.com", "scrapes.monitoring.example.com"]);
    // v1beta1 CRD is skipped
    assert_eq!(report.skipped, 1);
    assert_eq!(applied_names(&store), vec!["CustomResourceDefinition probes.monitoring.example.com", "CustomResourceDefinition scrapes.monitoring.example.com"]);

    let (ext, _) = collect_crds(&package(), Some("extension")).unwrap();
    assert_eq!(ext.len(), 1);
    assert_eq!(ext[0].name, "rules.monitoring.example.com");
    assert!(collect_crds(&package(), Some("none")).unwrap().0.is_empty());
}

#[tokio::test]
async fn second_sync_reports_no_diff() {
    let store = MemoryStore::new();
    let first = sync(&store, &package(), Some("agent")).await.unwrap();
    assert!(!first.unchanged());
    let second = sync(&store, &package(), Some("agent")).await.unwrap();
    assert!(second.unchanged(), "report={:?}", second);
    assert_eq!(second.applied.len(), 2);
}

#[tokio::test]
async fn apply_failure_aborts_sync() {
    let store = MemoryStore::new();
    store.reject_apply("admission webhook denied the request");
    let err = sync(&store, &package(), Some("agent")).await.unwrap_err();
    let SyncError::ApplyFailed { name, reason } = err;
    assert_eq!(name, "probes.monitoring.example.com");
    assert!(reason.contains("admission webhook"), "reason={}", reason);
    // stopped after the first failure
    assert_eq!(applied_names(&store).len(), 1);
    assert!(store.get(&ObjectRef::cluster(ResourceKind::CRD, "scrapes.monitoring.example.com")).await.unwrap().is_none());
}

#[tokio::test]
async fn undecodable_crd_fails() {
    let files = vec![
        ("bad/Chart.yaml", "name: bad\nversion: 0.1.0\n"),
        ("bad/crds/bad.yaml", "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: bad.example.com\nspec:\n  scope: 42\n"),
    ];
    let pkg = PackageDescriptor::load(&pack(&files).unwrap(), None).unwrap();
    let store = MemoryStore::new();
    assert!(matches!(sync(&store, &pkg, None).await, Err(SyncError::ApplyFailed { .. })));
}
