//! Argument and result codec
//!
//! Task inputs and outputs are stored as JSON byte blobs. An argument that
//! refers to another task's future result is stored as the tagged placeholder
//! `{"$dep": "<task id>"}`; the worker materializes placeholders by loading
//! the referenced result blob before execution. Encoding is canonical (sorted
//! object keys), so equal values always produce equal blobs and equal hashes.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Key tagging a dependency placeholder object.
pub const DEP_KEY: &str = "$dep";

/// Build a placeholder referring to another task's result.
pub fn dep_placeholder(id: &str) -> Value {
    let mut map = Map::new();
    map.insert(DEP_KEY.to_string(), Value::String(id.to_string()));
    Value::Object(map)
}

/// If `value` is a dependency placeholder, return the referenced task id.
pub fn as_dep(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(DEP_KEY).and_then(Value::as_str),
        _ => None,
    }
}

/// Canonicalize a value: object keys sorted, everything else untouched.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let mut out = Map::new();
            for (key, val) in sorted {
                out.insert(key.clone(), canonicalize(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Encode positional arguments to the canonical blob stored in `args`.
pub fn encode_args(args: &[Value]) -> crate::Result<Vec<u8>> {
    let canonical: Vec<Value> = args.iter().map(canonicalize).collect();
    Ok(serde_json::to_vec(&Value::Array(canonical))?)
}

pub fn decode_args(blob: &[u8]) -> crate::Result<Vec<Value>> {
    match serde_json::from_slice(blob)? {
        Value::Array(items) => Ok(items),
        other => Err(crate::PipelineError::QueueCorruption(format!(
            "args blob is not an array: {}",
            other
        ))
        .into()),
    }
}

/// Encode keyword arguments to the canonical blob stored in `kwargs`.
pub fn encode_kwargs(kwargs: &BTreeMap<String, Value>) -> crate::Result<Vec<u8>> {
    let mut map = Map::new();
    for (key, val) in kwargs {
        map.insert(key.clone(), canonicalize(val));
    }
    Ok(serde_json::to_vec(&Value::Object(map))?)
}

pub fn decode_kwargs(blob: &[u8]) -> crate::Result<BTreeMap<String, Value>> {
    match serde_json::from_slice(blob)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(crate::PipelineError::QueueCorruption(format!(
            "kwargs blob is not an object: {}",
            other
        ))
        .into()),
    }
}

/// Encode a task result value.
pub fn encode_result(value: &Value) -> crate::Result<Vec<u8>> {
    Ok(serde_json::to_vec(&canonicalize(value))?)
}

pub fn decode_result(blob: &[u8]) -> crate::Result<Value> {
    Ok(serde_json::from_slice(blob)?)
}

/// Collect the task ids of all dependency placeholders reachable in `value`.
pub fn collect_deps(value: &Value, deps: &mut BTreeSet<String>) {
    if let Some(id) = as_dep(value) {
        deps.insert(id.to_string());
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                collect_deps(item, deps);
            }
        }
        Value::Object(map) => {
            for val in map.values() {
                collect_deps(val, deps);
            }
        }
        _ => {}
    }
}

/// Replace every dependency placeholder with its materialized result.
///
/// Fails if a placeholder refers to an id missing from `results`; the caller
/// guarantees all dependencies are SUCCEEDED before execution.
pub fn substitute_deps(value: &Value, results: &BTreeMap<String, Value>) -> crate::Result<Value> {
    if let Some(id) = as_dep(value) {
        return results.get(id).cloned().ok_or_else(|| {
            crate::PipelineError::QueueCorruption(format!(
                "dependency {} has no materialized result",
                id
            ))
            .into()
        });
    }
    match value {
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| substitute_deps(item, results))
                .collect::<crate::Result<_>>()?,
        )),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, val) in map {
                out.insert(key.clone(), substitute_deps(val, results)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}
