//! RFC 6902 JSON Patch construction
//!
//! The admission response carries a sequence of patch operations that the
//! API server applies in order. The `json_patch` crate provides the typed
//! operations; the sequencing rules the injector depends on (descending
//! removals, empty-target creation, label non-overwrite) are assembled here
//! by a small set of builders parameterized over the target field.

use std::collections::{BTreeMap, HashSet};

use json_patch::{AddOperation, PatchOperation, RemoveOperation, ReplaceOperation};
use k8s_openapi::api::core::v1::{Container, LocalObjectReference, Volume};
use serde::Serialize;
use serde_json::{json, Value};

pub fn add_op(path: String, value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation { path, value })
}

pub fn replace_op(path: String, value: Value) -> PatchOperation {
    PatchOperation::Replace(ReplaceOperation { path, value })
}

pub fn remove_op(path: String) -> PatchOperation {
    PatchOperation::Remove(RemoveOperation { path })
}

/// Escape a string for use as an RFC 6901 JSON Pointer segment: `~` becomes
/// `~0` and `/` becomes `~1`.
pub fn escape_json_pointer(value: &str) -> String {
    value.replace('~', "~0").replace('/', "~1")
}

/// Pod array elements addressable by name for removal.
pub trait NamedItem {
    fn item_name(&self) -> &str;
}

impl NamedItem for Container {
    fn item_name(&self) -> &str {
        &self.name
    }
}

impl NamedItem for Volume {
    fn item_name(&self) -> &str {
        &self.name
    }
}

impl NamedItem for LocalObjectReference {
    fn item_name(&self) -> &str {
        &self.name
    }
}

/// Emit `remove` operations for every element of `current` whose name is in
/// `removed`.
///
/// JSON Patch `remove` is applied sequentially, so operations are emitted in
/// descending index order: earlier removals must not renumber the indices
/// referenced by later ones.
pub fn remove_named<T: NamedItem>(
    current: &[T],
    removed: &[String],
    path: &str,
) -> Vec<PatchOperation> {
    let names: HashSet<&str> = removed.iter().map(String::as_str).collect();
    let mut patch = Vec::new();
    for index in (0..current.len()).rev() {
        if names.contains(current[index].item_name()) {
            patch.push(remove_op(format!("{path}/{index}")));
        }
    }
    patch
}

/// Emit `add` operations appending `added` to the array at `path`.
///
/// The first element added to an empty array creates the array itself, with
/// a one-element list as value. Later elements append at `<path>/-`, or
/// prepend at `<path>/0` when `in_front` reports the element must run before
/// the existing ones.
pub fn add_to_array<T: Serialize>(
    target_empty: bool,
    added: &[T],
    path: &str,
    mut in_front: impl FnMut(&T) -> bool,
) -> Result<Vec<PatchOperation>, serde_json::Error> {
    let mut first = target_empty;
    let mut patch = Vec::new();
    for add in added {
        if first {
            first = false;
            patch.push(add_op(
                path.to_string(),
                serde_json::to_value(std::slice::from_ref(add))?,
            ));
        } else if in_front(add) {
            patch.push(add_op(format!("{path}/0"), serde_json::to_value(add)?));
        } else {
            patch.push(add_op(format!("{path}/-"), serde_json::to_value(add)?));
        }
    }
    Ok(patch)
}

/// Emit a single `add` for a scalar or object value (security context, DNS
/// config).
pub fn add_object<T: Serialize>(
    path: &str,
    value: &T,
) -> Result<PatchOperation, serde_json::Error> {
    Ok(add_op(path.to_string(), serde_json::to_value(value)?))
}

/// Emit annotation updates in lexicographic key order.
///
/// The first write on a pod without an annotation map creates the map with a
/// single entry. Otherwise a key that already holds a non-empty value is
/// `replace`d and any other key is `add`ed under its escaped pointer path.
pub fn update_annotations(
    target: Option<&BTreeMap<String, String>>,
    added: &BTreeMap<String, String>,
) -> Vec<PatchOperation> {
    let mut map_exists = target.is_some();
    let mut patch = Vec::new();
    for (key, value) in added {
        if !map_exists {
            map_exists = true;
            patch.push(add_op(
                "/metadata/annotations".to_string(),
                json!({ (key.clone()): value.clone() }),
            ));
            continue;
        }
        let occupied = target
            .and_then(|t| t.get(key))
            .is_some_and(|v| !v.is_empty());
        let path = format!("/metadata/annotations/{}", escape_json_pointer(key));
        patch.push(if occupied {
            replace_op(path, json!(value))
        } else {
            add_op(path, json!(value))
        });
    }
    patch
}

/// Emit label additions in lexicographic key order.
///
/// A key that already carries a non-empty value on the pod is left alone;
/// labels are never overwritten. The first write on a pod without a label map
/// creates the map.
pub fn add_labels(
    target: Option<&BTreeMap<String, String>>,
    added: &BTreeMap<String, String>,
) -> Vec<PatchOperation> {
    let mut map_exists = target.is_some();
    let mut patch = Vec::new();
    for (key, value) in added {
        let op = if map_exists {
            add_op(
                format!("/metadata/labels/{}", escape_json_pointer(key)),
                json!(value),
            )
        } else {
            map_exists = true;
            add_op(
                "/metadata/labels".to_string(),
                json!({ (key.clone()): value.clone() }),
            )
        };
        let occupied = target
            .and_then(|t| t.get(key))
            .is_some_and(|v| !v.is_empty());
        if !occupied {
            patch.push(op);
        }
    }
    patch
}

#[cfg(test)]
#[path = "patch_test.rs"]
mod tests;
