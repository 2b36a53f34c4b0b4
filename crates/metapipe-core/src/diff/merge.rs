//! Combining desired metadata with what is already on disk.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::patch::{apply_patch, diff_values, PatchError, PatchOp};

/// How a desired `meta` object is folded into existing metadata.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Top-level keys of the desired object overwrite existing ones.
    #[default]
    Shallow,
    /// Objects merge recursively; any other value overwrites.
    Deep,
    /// The desired object becomes the result, applied as a computed patch.
    Jsonpatch,
}

/// What a post-map callback asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Desired {
    Meta(Value),
    Patch(Vec<PatchOp>),
}

impl Desired {
    /// Resolve against `existing` (absent for files without metadata).
    pub fn resolve(&self, existing: Option<&Value>, strategy: MergeStrategy) -> Result<Value, PatchError> {
        match (self, existing) {
            (Desired::Patch(ops), Some(base)) => apply_patch(base, ops),
            (Desired::Patch(ops), None) => apply_patch(&Value::Object(Map::new()), ops),
            (Desired::Meta(meta), None) => Ok(meta.clone()),
            (Desired::Meta(meta), Some(base)) => merge(base, meta, strategy),
        }
    }
}

/// Merge `desired` into `existing` under `strategy`.
pub fn merge(existing: &Value, desired: &Value, strategy: MergeStrategy) -> Result<Value, PatchError> {
    match strategy {
        MergeStrategy::Shallow => Ok(shallow_merge(existing, desired)),
        MergeStrategy::Deep => Ok(deep_merge(existing, desired)),
        MergeStrategy::Jsonpatch => apply_patch(existing, &diff_values(existing, desired)),
    }
}

fn shallow_merge(existing: &Value, desired: &Value) -> Value {
    match (existing, desired) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut out = base.clone();
            for (key, value) in overlay {
                out.insert(key.clone(), value.clone());
            }
            Value::Object(out)
        }
        _ => desired.clone(),
    }
}

fn deep_merge(existing: &Value, desired: &Value) -> Value {
    match (existing, desired) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut out = base.clone();
            for (key, value) in overlay {
                let merged = match out.get(key) {
                    Some(current) => deep_merge(current, value),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        _ => desired.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shallow_replaces_nested_objects() {
        let existing = json!({"a": {"x": 1, "y": 2}, "keep": true});
        let desired = json!({"a": {"x": 9}});
        assert_eq!(
            merge(&existing, &desired, MergeStrategy::Shallow).unwrap(),
            json!({"a": {"x": 9}, "keep": true})
        );
    }

    #[test]
    fn test_deep_merges_nested_objects() {
        let existing = json!({"a": {"x": 1, "y": 2}, "list": [1, 2]});
        let desired = json!({"a": {"x": 9}, "list": [3]});
        assert_eq!(
            merge(&existing, &desired, MergeStrategy::Deep).unwrap(),
            json!({"a": {"x": 9, "y": 2}, "list": [3]})
        );
    }

    #[test]
    fn test_jsonpatch_yields_desired_exactly() {
        let existing = json!({"a": 1, "b": [1, 2]});
        let desired = json!({"b": [2], "c": null});
        assert_eq!(
            merge(&existing, &desired, MergeStrategy::Jsonpatch).unwrap(),
            desired
        );
    }

    #[test]
    fn test_patch_applies_to_empty_object_without_existing() {
        let desired = Desired::Patch(vec![PatchOp::add("/owner", json!("ops"))]);
        assert_eq!(
            desired.resolve(None, MergeStrategy::Shallow).unwrap(),
            json!({"owner": "ops"})
        );
    }

    #[test]
    fn test_meta_without_existing_is_taken_verbatim() {
        let desired = Desired::Meta(json!({"k": 1}));
        assert_eq!(desired.resolve(None, MergeStrategy::Deep).unwrap(), json!({"k": 1}));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let existing = json!({"a": {"x": 1}});
        let desired = json!({"a": {"y": 2}});
        for strategy in [MergeStrategy::Shallow, MergeStrategy::Deep, MergeStrategy::Jsonpatch] {
            let once = merge(&existing, &desired, strategy).unwrap();
            let twice = merge(&once, &desired, strategy).unwrap();
            assert_eq!(once, twice, "{strategy:?}");
        }
    }
}
