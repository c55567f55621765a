//! Nested JSON tree addressed by [`StatePath`]s.

use serde_json::{Map, Value};

use crate::error::StateError;
use crate::path::StatePath;

/// Read the value at `path`, if every segment resolves.
pub fn get_at<'a>(root: &'a Value, path: &StatePath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(root, |node, segment| node.as_object()?.get(segment))
}

/// Write `value` at `path`, creating intermediate objects as needed.
///
/// Returns the previous value at the leaf. A `null` intermediate is
/// replaced by an object; any other non-object intermediate is a
/// [`StateError::PathConflict`] and leaves the tree untouched.
pub fn set_at(root: &mut Value, path: &StatePath, value: Value) -> Result<Option<Value>, StateError> {
    check_extendable(root, path)?;

    let (leaf, parents) = path
        .segments()
        .split_last()
        .ok_or_else(|| StateError::invalid_path(path.as_str(), "path is empty"))?;

    let mut node = root;
    for segment in parents {
        let map = ensure_object(node);
        node = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(ensure_object(node).insert(leaf.clone(), value))
}

fn check_extendable(root: &Value, path: &StatePath) -> Result<(), StateError> {
    let mut node = root;
    let parents = path.segments().len() - 1;
    for (depth, segment) in path.segments()[..parents].iter().enumerate() {
        match node {
            Value::Object(map) => match map.get(segment) {
                Some(next) => node = next,
                None => return Ok(()),
            },
            Value::Null => return Ok(()),
            _ => {
                return Err(StateError::PathConflict {
                    path: path.to_string(),
                    blocked_at: path.prefix(depth),
                });
            }
        }
    }
    match node {
        Value::Object(_) | Value::Null => Ok(()),
        _ => Err(StateError::PathConflict {
            path: path.to_string(),
            blocked_at: path.prefix(parents),
        }),
    }
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced by an object"),
    }
}

/// Flatten the tree into `(path, value)` pairs for every leaf.
///
/// Scalars, arrays and empty objects are leaves. Ordered by path.
pub fn leaves(root: &Value) -> Vec<(String, Value)> {
    fn walk(prefix: &str, node: &Value, out: &mut Vec<(String, Value)>) {
        match node {
            Value::Object(map) if !map.is_empty() => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(&path, child, out);
                }
            }
            _ if prefix.is_empty() => {}
            _ => out.push((prefix.to_string(), node.clone())),
        }
    }

    let mut out = Vec::new();
    walk("", root, &mut out);
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}
