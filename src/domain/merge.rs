//! Deep-merge for JSON-flagged columns.
//!
//! Partial updates to a JSON column merge the incoming tree into the stored
//! tree instead of replacing it. An explicit `null` leaf in the incoming
//! tree deletes the corresponding key from the stored tree.

use serde_json::Value;

/// Merge `incoming` into `existing`, returning the merged tree.
///
/// Objects merge key by key, recursing into shared keys; any other value
/// kind replaces the stored one. A `null` leaf removes the key it targets,
/// so callers can prune stored state without resending the whole document.
pub fn deep_merge(existing: &Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Object(old), Value::Object(new)) => {
            let mut merged = old.clone();
            for (key, value) in new {
                if value.is_null() {
                    merged.remove(key);
                } else if let Some(prior) = old.get(key) {
                    merged.insert(key.clone(), deep_merge(prior, value));
                } else {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Object(merged)
        }
        _ => incoming.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merges_disjoint_keys() {
        let merged = deep_merge(&json!({"a": 1}), &json!({"b": 2}));
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn incoming_scalar_wins() {
        let merged = deep_merge(&json!({"a": 1}), &json!({"a": 2}));
        assert_eq!(merged, json!({"a": 2}));
    }

    #[test]
    fn null_leaf_deletes_key() {
        let merged = deep_merge(&json!({"a": 1, "b": 2}), &json!({"b": null}));
        assert_eq!(merged, json!({"a": 1}));
    }

    #[test]
    fn recurses_into_nested_objects() {
        let existing = json!({"outer": {"keep": 1, "drop": 2, "replace": 3}});
        let incoming = json!({"outer": {"drop": null, "replace": 4, "add": 5}});
        let merged = deep_merge(&existing, &incoming);
        assert_eq!(merged, json!({"outer": {"keep": 1, "replace": 4, "add": 5}}));
    }

    #[test]
    fn non_object_existing_is_replaced() {
        let merged = deep_merge(&json!([1, 2]), &json!({"a": 1}));
        assert_eq!(merged, json!({"a": 1}));
    }
}
