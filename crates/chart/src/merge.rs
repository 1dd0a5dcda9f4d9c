//! Instance config merger.
//!
//! Stored instance config is layered over the target package's own
//! defaults. Only the package's values-only view takes part, so defaults of
//! bundled sub-packages never show up as new keys in the instance config.

use serde_json::Value;

use keel_core::{merge_tree, parse_yaml, to_yaml};

use crate::PackageDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("instance config is not a valid mapping: {0}")]
    BadInstanceConfig(String),
    #[error("serializing merged config: {0}")]
    Serialize(String),
}

/// Merge instance config text with `target`'s defaults; instance values win.
/// An instance `null` is kept as `key: null`.
pub fn merge(instance_text: &str, target: &PackageDescriptor) -> Result<String, MergeError> {
    let instance = parse_yaml(instance_text).map_err(|e| MergeError::BadInstanceConfig(e.to_string()))?;
    let merged = merge_values(&instance, target);
    to_yaml(&merged).map_err(|e| MergeError::Serialize(e.to_string()))
}

pub fn merge_values(instance: &Value, target: &PackageDescriptor) -> Value {
    let view = target.mergeable_view();
    merge_tree(&view.coalesced_values(), instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack;
    use serde_json::json;

    fn target() -> PackageDescriptor {
        let bytes = pack(&[
            ("mon/Chart.yaml", "name: mon\nversion: 1.2.0\ndependencies:\n  - name: exporter\n"),
            ("mon/values.yaml", "retention: 7d\nexporter:\n  enabled: true\nresources:\n  cpu: 100m\n"),
            ("mon/charts/exporter/Chart.yaml", "name: exporter\nversion: 1.0.0\n"),
            ("mon/charts/exporter/values.yaml", "image:\n  tag: v1.8.1\nport: 9100\n"),
        ])
        .unwrap();
        PackageDescriptor::load(&bytes, None).unwrap()
    }

    #[test]
    fn instance_wins_and_new_defaults_appear() {
        let out = merge("retention: 30d\nresources:\n  memory: 1Gi\ncustom: yes-please\n", &target()).unwrap();
        let v = parse_yaml(&out).unwrap();
        assert_eq!(v["retention"], json!("30d"));
        assert_eq!(v["resources"], json!({ "memory": "1Gi", "cpu": "100m" }));
        assert_eq!(v["custom"], json!("yes-please"));
        assert_eq!(v["exporter"], json!({ "enabled": true }));
    }

    #[test]
    fn instance_null_survives_merge() {
        let bytes = pack(&[
            ("mon/Chart.yaml", "name: mon\nversion: 1.3.0\n"),
            ("mon/values.yaml", "nodeSelector:\n  role: infra\nretention: 7d\n"),
        ])
        .unwrap();
        let t = PackageDescriptor::load(&bytes, None).unwrap();
        let out = merge("nodeSelector: null\n", &t).unwrap();
        let v = parse_yaml(&out).unwrap();
        assert_eq!(v, json!({ "nodeSelector": null, "retention": "7d" }), "out={}", out);
        assert!(v.as_object().unwrap().contains_key("nodeSelector"));
        // stays null on the next upgrade
        assert_eq!(parse_yaml(&merge(&out, &t).unwrap()).unwrap(), v);
    }

    #[test]
    fn nested_dependency_defaults_do_not_leak() {
        let v = merge_values(&json!({}), &target());
        assert!(v["exporter"].get("image").is_none(), "v={}", v);
        assert!(v["exporter"].get("port").is_none(), "v={}", v);
    }

    #[test]
    fn merge_is_idempotent() {
        let t = target();
        let once = merge("retention: 14d\nextra:\n  a: [1, 2]\n", &t).unwrap();
        let twice = merge(&once, &t).unwrap();
        assert_eq!(parse_yaml(&once).unwrap(), parse_yaml(&twice).unwrap());
    }

    #[test]
    fn empty_instance_yields_defaults_and_scalars_are_rejected() {
        let t = target();
        assert_eq!(parse_yaml(&merge("", &t).unwrap()).unwrap(), t.defaults);
        assert!(matches!(merge("just a string", &t), Err(MergeError::BadInstanceConfig(_))));
        assert!(t.subpackages.len() == 1, "target must stay untouched");
    }
}
