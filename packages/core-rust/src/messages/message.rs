//! Path-addressable nested key/value container.
//!
//! A [`Message`] is the common shape of every STREST request and response:
//! a tree of string keys whose leaves are [`Value`]s. Keys are addressed by
//! dot-delimited paths (`"strest.txn.id"`). Writes create intermediate maps
//! on demand; reads never fail and fall back to a typed zero value unless a
//! `*_strict` accessor is used.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Errors from strict [`Message`] accessors and conversions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("no value at path '{path}'")]
    NotFound { path: String },
    #[error("value at path '{path}' is {found}, expected {expected}")]
    WrongType {
        path: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("message root must be an object, got {found}")]
    NotAnObject { found: &'static str },
}

/// Nested, path-addressable mapping from string keys to [`Value`]s.
///
/// Serializes transparently as its root object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    root: BTreeMap<String, Value>,
}

/// Splits a dot path into its non-empty segments.
fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|segment| !segment.is_empty())
}

impl Message {
    /// Creates an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the message holds no keys at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Borrows the root object.
    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.root
    }

    /// Looks up the value at `path`. Absent paths, paths that run through a
    /// non-map value, and paths without segments all return `None`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = segments(path);
        let mut current = self.root.get(parts.next()?)?;
        for part in parts {
            current = current.as_map()?.get(part)?;
        }
        Some(current)
    }

    /// Like [`get`](Self::get) but fails with [`MessageError::NotFound`].
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when nothing is stored at `path`.
    pub fn get_strict(&self, path: &str) -> Result<&Value, MessageError> {
        self.get(path).ok_or_else(|| MessageError::NotFound {
            path: path.to_string(),
        })
    }

    /// Returns `true` if a value (including `null`) is stored at `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Borrows a string stored at `path` without coercion; `""` otherwise.
    #[must_use]
    pub fn get_str(&self, path: &str) -> &str {
        self.get(path).and_then(Value::as_str).unwrap_or("")
    }

    /// String view of the scalar at `path`; `""` when absent or not a scalar.
    #[must_use]
    pub fn get_string(&self, path: &str) -> String {
        self.get_string_or(path, "")
    }

    /// String view of the scalar at `path`, or `default`.
    #[must_use]
    pub fn get_string_or(&self, path: &str, default: &str) -> String {
        self.get(path)
            .and_then(Value::coerce_string)
            .unwrap_or_else(|| default.to_string())
    }

    /// Integer view of the value at `path`; `0` when absent or not coercible.
    #[must_use]
    pub fn get_i64(&self, path: &str) -> i64 {
        self.get_i64_or(path, 0)
    }

    /// Integer view of the value at `path`, or `default`.
    #[must_use]
    pub fn get_i64_or(&self, path: &str, default: i64) -> i64 {
        self.get(path).and_then(Value::coerce_i64).unwrap_or(default)
    }

    /// Float view of the value at `path`; `0.0` when absent or not coercible.
    #[must_use]
    pub fn get_f64(&self, path: &str) -> f64 {
        self.get(path).and_then(Value::coerce_f64).unwrap_or(0.0)
    }

    /// Boolean view of the value at `path`; `false` when absent or not coercible.
    #[must_use]
    pub fn get_bool(&self, path: &str) -> bool {
        self.get(path).and_then(Value::coerce_bool).unwrap_or(false)
    }

    #[must_use]
    pub fn get_map(&self, path: &str) -> Option<&BTreeMap<String, Value>> {
        self.get(path).and_then(Value::as_map)
    }

    #[must_use]
    pub fn get_array(&self, path: &str) -> Option<&[Value]> {
        self.get(path).and_then(Value::as_array)
    }

    /// Strict string accessor.
    ///
    /// # Errors
    ///
    /// `NotFound` when absent, `WrongType` when the value is not a scalar.
    pub fn get_string_strict(&self, path: &str) -> Result<String, MessageError> {
        let value = self.get_strict(path)?;
        value.coerce_string().ok_or_else(|| MessageError::WrongType {
            path: path.to_string(),
            expected: "string",
            found: value.type_name(),
        })
    }

    /// Strict integer accessor.
    ///
    /// # Errors
    ///
    /// `NotFound` when absent, `WrongType` when the value cannot be read as an integer.
    pub fn get_i64_strict(&self, path: &str) -> Result<i64, MessageError> {
        let value = self.get_strict(path)?;
        value.coerce_i64().ok_or_else(|| MessageError::WrongType {
            path: path.to_string(),
            expected: "int",
            found: value.type_name(),
        })
    }

    /// Stores `value` at `path`, creating intermediate maps as needed.
    ///
    /// Any non-map value sitting on an intermediate segment is replaced by a
    /// map. A path without segments is ignored.
    pub fn put(&mut self, path: &str, value: impl Into<Value>) {
        let parts: Vec<&str> = segments(path).collect();
        insert_at(&mut self.root, &parts, value.into());
    }

    /// Removes and returns the value at `path`. Emptied parent maps are kept.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let parts: Vec<&str> = segments(path).collect();
        remove_at(&mut self.root, &parts)
    }

    /// Lists every leaf as `(dot_path, value)`, sorted by path.
    ///
    /// Non-empty maps are descended into; scalars, arrays, and empty maps
    /// are leaves.
    #[must_use]
    pub fn flatten(&self) -> Vec<(String, &Value)> {
        let mut out = Vec::new();
        collect_leaves(&self.root, "", &mut out);
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Converts into a `serde_json::Value` object.
    #[must_use]
    pub fn to_json_value(&self) -> serde_json::Value {
        // A map of `Value`s always has a JSON form; non-finite floats become null.
        serde_json::to_value(&self.root).unwrap_or(serde_json::Value::Null)
    }

    /// Builds a message from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns `NotAnObject` if `json` is not an object.
    pub fn from_json_value(json: serde_json::Value) -> Result<Self, MessageError> {
        match serde_json::from_value::<Value>(json) {
            Ok(Value::Map(root)) => Ok(Self { root }),
            Ok(other) => Err(MessageError::NotAnObject {
                found: other.type_name(),
            }),
            Err(_) => Err(MessageError::NotAnObject { found: "invalid" }),
        }
    }
}

impl From<BTreeMap<String, Value>> for Message {
    fn from(root: BTreeMap<String, Value>) -> Self {
        Self { root }
    }
}

impl TryFrom<Value> for Message {
    type Error = MessageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Map(root) => Ok(Self { root }),
            other => Err(MessageError::NotAnObject {
                found: other.type_name(),
            }),
        }
    }
}

fn insert_at(map: &mut BTreeMap<String, Value>, parts: &[&str], value: Value) {
    match parts {
        [] => {}
        [leaf] => {
            map.insert((*leaf).to_string(), value);
        }
        [head, rest @ ..] => {
            let child = map.entry((*head).to_string()).or_default();
            if let Value::Map(inner) = child {
                insert_at(inner, rest, value);
            } else {
                let mut inner = BTreeMap::new();
                insert_at(&mut inner, rest, value);
                *child = Value::Map(inner);
            }
        }
    }
}

fn remove_at(map: &mut BTreeMap<String, Value>, parts: &[&str]) -> Option<Value> {
    match parts {
        [] => None,
        [leaf] => map.remove(*leaf),
        [head, rest @ ..] => match map.get_mut(*head)? {
            Value::Map(inner) => remove_at(inner, rest),
            _ => None,
        },
    }
}

fn collect_leaves<'a>(
    map: &'a BTreeMap<String, Value>,
    prefix: &str,
    out: &mut Vec<(String, &'a Value)>,
) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Map(inner) if !inner.is_empty() => collect_leaves(inner, &path, out),
            _ => out.push((path, value)),
        }
    }
}
