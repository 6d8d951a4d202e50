//! Replicated shared-object storage.
//!
//! §3 "Shared object": a process-wide mapping nodeIndex -> (seq, tree).
//! Tree is a nested string-keyed mapping whose leaves are scalars or nested
//! trees. Grounded on the teacher's `state/membership.rs` map-of-node-state
//! shape, generalized from a flat struct to an arbitrary nested JSON tree
//! because the spec's shared object is schemaless.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One node's replicated subtree plus its sequence number.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SharedEntry {
    pub seq: u64,
    pub tree: Map<String, Value>,
}

/// Split a dotted path into segments. Empty path addresses the tree root.
pub fn split_path(path: &str) -> Vec<&str> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').collect()
    }
}

/// Deep merge `delta` into `tree`: for each key, if both sides hold a
/// nested object, recurse; otherwise the delta's value overwrites.
/// I-round-trip: `merge(a, merge(a, b)) == merge(a, b)` (idempotent).
pub fn deep_merge(tree: &mut Map<String, Value>, delta: &Map<String, Value>) {
    for (key, delta_value) in delta {
        match (tree.get_mut(key), delta_value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                tree.insert(key.clone(), delta_value.clone());
            }
        }
    }
}

/// Apply a merge at an arbitrary dotted path under `tree`, creating
/// intermediate objects as needed.
pub fn merge_at_path(tree: &mut Map<String, Value>, path: &str, value: Value) {
    let segments = split_path(path);
    if segments.is_empty() {
        if let Value::Object(obj) = value {
            deep_merge(tree, &obj);
        }
        return;
    }
    let mut cursor = tree;
    for segment in &segments[..segments.len() - 1] {
        let entry = cursor
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        cursor = entry.as_object_mut().expect("just ensured object");
    }
    let last = segments[segments.len() - 1];
    match (cursor.get_mut(last), &value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            deep_merge(existing, incoming);
        }
        _ => {
            cursor.insert(last.to_string(), value);
        }
    }
}

/// Read the value at a dotted path, or `None` if absent.
pub fn get_at_path<'a>(tree: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let segments = split_path(path);
    if segments.is_empty() {
        return None;
    }
    let mut cursor = tree;
    for segment in &segments[..segments.len() - 1] {
        cursor = cursor.get(*segment)?.as_object()?;
    }
    cursor.get(segments[segments.len() - 1])
}

/// Delete the value at a dotted path. Ancestors that become empty are
/// pruned upward (§3 lifecycle, §8 round-trip laws).
pub fn delete_at_path(tree: &mut Map<String, Value>, path: &str) {
    let segments = split_path(path);
    if segments.is_empty() {
        tree.clear();
        return;
    }
    delete_recursive(tree, &segments);
}

fn delete_recursive(tree: &mut Map<String, Value>, segments: &[&str]) -> bool {
    if segments.len() == 1 {
        tree.remove(segments[0]);
    } else if let Some(Value::Object(child)) = tree.get_mut(segments[0]) {
        let child_empty = delete_recursive(child, &segments[1..]);
        if child_empty {
            tree.remove(segments[0]);
        }
    }
    tree.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge_overwrites_scalars() {
        let mut tree = json!({"a": 1, "b": {"c": 2}}).as_object().unwrap().clone();
        let delta = json!({"a": 2, "b": {"d": 3}}).as_object().unwrap().clone();
        deep_merge(&mut tree, &delta);
        assert_eq!(tree, *json!({"a": 2, "b": {"c": 2, "d": 3}}).as_object().unwrap());
    }

    #[test]
    fn test_merge_idempotent() {
        let mut a = json!({"x": {"y": 1}}).as_object().unwrap().clone();
        let b = json!({"x": {"z": 2}}).as_object().unwrap().clone();

        let mut once = a.clone();
        deep_merge(&mut once, &b);

        let mut twice = once.clone();
        deep_merge(&mut twice, &b);

        assert_eq!(once, twice);
        let _ = &mut a;
    }

    #[test]
    fn test_merge_and_get_round_trip() {
        let mut tree = Map::new();
        merge_at_path(&mut tree, "devices.d1.tag", json!("42"));
        assert_eq!(get_at_path(&tree, "devices.d1.tag"), Some(&json!("42")));
    }

    #[test]
    fn test_delete_prunes_empty_ancestors() {
        let mut tree = Map::new();
        merge_at_path(&mut tree, "devices.d1.tag", json!("42"));
        delete_at_path(&mut tree, "devices.d1.tag");
        assert_eq!(get_at_path(&tree, "devices.d1.tag"), None);
        assert!(!tree.contains_key("devices"));
    }

    #[test]
    fn test_delete_leaves_sibling_keys() {
        let mut tree = Map::new();
        merge_at_path(&mut tree, "devices.d1.tag", json!("42"));
        merge_at_path(&mut tree, "devices.d2.tag", json!("7"));
        delete_at_path(&mut tree, "devices.d1.tag");
        assert_eq!(get_at_path(&tree, "devices.d2.tag"), Some(&json!("7")));
        assert!(tree.contains_key("devices"));
    }
}
