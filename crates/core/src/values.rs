//! Value trees: configuration documents (chart defaults, instance config,
//! dynamic options) held as ordered `serde_json::Value` mappings.
//!
//! - YAML text is read through `serde_yaml::Value` and converted, so the same
//!   tree type serves YAML and JSON sources.
//! - Dotted paths (`a.b.c`) address nested mappings; lookups report whether a
//!   path was found, absent, or blocked by a non-mapping segment.
//! - `coalesce` layers overrides on top of defaults the way chart values are
//!   layered: mappings merge key by key, a `null` override deletes the key.

use serde_json::{Map, Value};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ValuesError {
    #[error("parsing YAML: {0}")]
    Parse(String),
    #[error("document root must be a mapping, got {0}")]
    NotAMapping(&'static str),
    #[error("serializing YAML: {0}")]
    Serialize(String),
}

/// Parse a YAML (or JSON) document into a mapping. Empty documents yield an empty mapping.
pub fn parse_yaml(text: &str) -> Result<Value, ValuesError> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let yaml: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| ValuesError::Parse(e.to_string()))?;
    let json = serde_json::to_value(yaml).map_err(|e| ValuesError::Parse(e.to_string()))?;
    match json {
        Value::Object(_) => Ok(json),
        Value::Null => Ok(Value::Object(Map::new())),
        other => Err(ValuesError::NotAMapping(kind_name(&other))),
    }
}

pub fn to_yaml(tree: &Value) -> Result<String, ValuesError> {
    serde_yaml::to_string(tree).map_err(|e| ValuesError::Serialize(e.to_string()))
}

pub fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// Outcome of addressing a dotted path inside a tree.
#[derive(Debug, Clone, PartialEq)]
pub enum PathLookup<'a> {
    Found(&'a Value),
    NotFound,
    /// Segment at `at` (dotted prefix) is not a mapping, so the path cannot continue.
    TypeMismatch { at: String },
}

impl<'a> PathLookup<'a> {
    pub fn found(self) -> Option<&'a Value> {
        match self {
            PathLookup::Found(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(self) -> Option<&'a str> { self.found().and_then(Value::as_str) }

    pub fn as_bool(self) -> Option<bool> { self.found().and_then(Value::as_bool) }

    pub fn is_found(&self) -> bool { matches!(self, PathLookup::Found(_)) }
}

pub fn lookup<'a>(tree: &'a Value, path: &str) -> PathLookup<'a> {
    match tree {
        Value::Object(map) => lookup_map(map, path),
        _ => PathLookup::TypeMismatch { at: String::new() },
    }
}

pub fn lookup_map<'a>(map: &'a Map<String, Value>, path: &str) -> PathLookup<'a> {
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();
    let mut cur = match map.get(first) {
        Some(v) => v,
        None => return PathLookup::NotFound,
    };
    let mut walked = first.to_string();
    for seg in segments {
        match cur {
            Value::Object(m) => match m.get(seg) {
                Some(next) => cur = next,
                None => return PathLookup::NotFound,
            },
            _ => return PathLookup::TypeMismatch { at: walked },
        }
        walked.push('.');
        walked.push_str(seg);
    }
    PathLookup::Found(cur)
}

/// Remove the value at `path`, keeping the order of the remaining keys.
/// Returns the removed value, or `None` when the path does not resolve.
pub fn remove_at(tree: &mut Value, path: &str) -> Option<Value> {
    let (parent_path, leaf) = match path.rsplit_once('.') {
        Some((p, l)) => (Some(p), l),
        None => (None, path),
    };
    let mut cur = tree;
    if let Some(parent_path) = parent_path {
        for seg in parent_path.split('.') {
            cur = cur.as_object_mut()?.get_mut(seg)?;
        }
    }
    cur.as_object_mut()?.shift_remove(leaf)
}

/// Layer `overrides` on top of `defaults` and return a new tree; neither input is modified.
///
/// Mappings merge key by key. Any other override value replaces the default.
/// A `null` override removes the key when the defaults define it.
pub fn coalesce(defaults: &Value, overrides: &Value) -> Value { layer(defaults, overrides, NullOverride::Delete) }

/// Like [`coalesce`], but a `null` override stays in the result as an
/// explicit `key: null` instead of deleting the key.
pub fn merge_tree(defaults: &Value, overrides: &Value) -> Value { layer(defaults, overrides, NullOverride::Keep) }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NullOverride {
    Delete,
    Keep,
}

fn layer(defaults: &Value, overrides: &Value, nulls: NullOverride) -> Value {
    match (defaults, overrides) {
        (Value::Object(d), Value::Object(o)) => {
            let mut out = o.clone();
            layer_into(&mut out, d, "", nulls);
            Value::Object(out)
        }
        (_, Value::Null) => defaults.clone(),
        _ => overrides.clone(),
    }
}

fn layer_into(dst: &mut Map<String, Value>, defaults: &Map<String, Value>, prefix: &str, nulls: NullOverride) {
    for (key, dv) in defaults.iter() {
        let full = if prefix.is_empty() { key.clone() } else { format!("{}.{}", prefix, key) };
        let present = dst.get(key).map(Value::is_null);
        match present {
            None => {
                dst.insert(key.clone(), dv.clone());
            }
            Some(true) => {
                if nulls == NullOverride::Delete {
                    dst.shift_remove(key);
                }
            }
            Some(false) => match (dst.get_mut(key), dv) {
                (Some(Value::Object(sub)), Value::Object(dsub)) => layer_into(sub, dsub, &full, nulls),
                (Some(Value::Object(_)), Value::Null) => {}
                (Some(Value::Object(_)), _) => warn!(key = %full, "mapping overrides a non-mapping default"),
                (Some(_), Value::Object(_)) => warn!(key = %full, "non-mapping value overrides a mapping default"),
                _ => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_reports_found_missing_and_mismatch() {
        let v = json!({ "a": { "b": { "c": "x" }, "s": 1 } });
        assert_eq!(lookup(&v, "a.b.c").as_str(), Some("x"));
        assert_eq!(lookup(&v, "a.b.d"), PathLookup::NotFound);
        assert_eq!(lookup(&v, "z"), PathLookup::NotFound);
        assert_eq!(lookup(&v, "a.s.t"), PathLookup::TypeMismatch { at: "a.s".into() });
        assert_eq!(lookup(&json!([1]), "a"), PathLookup::TypeMismatch { at: String::new() });
    }

    #[test]
    fn remove_at_prunes_leaf_and_keeps_order() {
        let mut v = json!({ "img": { "registry": "quay.io", "tag": "v1", "repo": "p" } });
        assert_eq!(remove_at(&mut v, "img.tag"), Some(json!("v1")));
        let keys: Vec<_> = v["img"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["registry", "repo"]);
        assert_eq!(remove_at(&mut v, "img.tag"), None);
        assert_eq!(remove_at(&mut v, "img.registry.x"), None);
    }

    #[test]
    fn coalesce_prefers_overrides_and_fills_defaults() {
        let defaults = json!({ "a": 1, "m": { "x": 1, "y": 2 }, "gone": { "k": true } });
        let overrides = json!({ "a": 5, "m": { "y": 9, "z": 3 }, "gone": null, "extra": "e" });
        let out = coalesce(&defaults, &overrides);
        assert_eq!(out, json!({ "a": 5, "m": { "y": 9, "z": 3, "x": 1 }, "extra": "e" }));
        // inputs untouched
        assert_eq!(defaults["gone"], json!({ "k": true }));
        assert_eq!(overrides["gone"], Value::Null);
    }

    #[test]
    fn merge_tree_keeps_null_overrides() {
        let defaults = json!({ "nodeSelector": { "role": "infra" }, "m": { "x": 1, "y": 2 }, "keep": 1 });
        let overrides = json!({ "nodeSelector": null, "m": { "y": null } });
        let out = merge_tree(&defaults, &overrides);
        assert_eq!(out, json!({ "nodeSelector": null, "m": { "y": null, "x": 1 }, "keep": 1 }));
        assert!(out.as_object().unwrap().contains_key("nodeSelector"));
        assert_eq!(merge_tree(&defaults, &Value::Null), defaults);
        // same input through coalesce drops both keys
        assert_eq!(coalesce(&defaults, &overrides), json!({ "m": { "x": 1 }, "keep": 1 }));
    }

    #[test]
    fn coalesce_keeps_override_on_shape_mismatch() {
        let defaults = json!({ "m": { "x": 1 }, "s": "str" });
        let overrides = json!({ "m": "flat", "s": { "nested": true } });
        assert_eq!(coalesce(&defaults, &overrides), overrides);
    }

    #[test]
    fn parse_yaml_handles_empty_and_rejects_scalars() {
        assert_eq!(parse_yaml("").unwrap(), json!({}));
        assert_eq!(parse_yaml("# only a comment\n").unwrap(), json!({}));
        assert_eq!(parse_yaml("a:\n  b: [1, 2]\n").unwrap(), json!({ "a": { "b": [1, 2] } }));
        assert!(matches!(parse_yaml("- 1\n- 2\n"), Err(ValuesError::NotAMapping("sequence"))));
        assert!(matches!(parse_yaml("a: [\n"), Err(ValuesError::Parse(_))));
    }

    #[test]
    fn yaml_round_trip_keeps_key_order() {
        let v = parse_yaml("zeta: 1\nalpha: 2\n").unwrap();
        let text = to_yaml(&v).unwrap();
        assert!(text.find("zeta").unwrap() < text.find("alpha").unwrap(), "text={}", text);
    }
}
