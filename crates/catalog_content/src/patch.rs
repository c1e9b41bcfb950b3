//! JSON-Patch style document operations.
//!
//! Operations are applied with [`apply`], which never mutates its input: it
//! returns a patched copy, so a failing operation leaves the caller's
//! document exactly as it was.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while applying a patch operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatchError {
    /// The path is not a JSON pointer.
    #[error("invalid path '{0}'")]
    InvalidPath(String),

    /// The path does not address an existing value.
    #[error("path '{0}' does not exist")]
    PathNotFound(String),

    /// The path addresses a scalar where a container was expected.
    #[error("path '{0}' is not an object or array")]
    NotAContainer(String),

    /// An array index is past the end of the array.
    #[error("index {index} out of bounds at '{path}' (len {len})")]
    IndexOutOfBounds {
        /// Offending path.
        path: String,
        /// Requested index.
        index: usize,
        /// Array length.
        len: usize,
    },

    /// The operation needs a `value`.
    #[error("'{0}' operation requires a value")]
    MissingValue(PatchOp),

    /// The operation needs a `from`.
    #[error("'{0}' operation requires a from path")]
    MissingFrom(PatchOp),

    /// A `test` operation did not match.
    #[error("test failed at '{0}'")]
    TestFailed(String),
}

/// Patch operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Insert or set a value.
    Add,
    /// Remove a value.
    Remove,
    /// Replace an existing value.
    Replace,
    /// Move a value to another path.
    Move,
    /// Copy a value to another path.
    Copy,
    /// Assert a value.
    Test,
}

impl std::fmt::Display for PatchOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PatchOp::Add => "add",
            PatchOp::Remove => "remove",
            PatchOp::Replace => "replace",
            PatchOp::Move => "move",
            PatchOp::Copy => "copy",
            PatchOp::Test => "test",
        };
        f.write_str(name)
    }
}

/// A single patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    /// Operation kind.
    pub op: PatchOp,
    /// Target JSON pointer.
    pub path: String,
    /// Source pointer for `move` and `copy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Value for `add`, `replace` and `test`. An explicit `null` is kept.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
}

impl PatchOperation {
    /// Creates an `add` operation.
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self::with_value(PatchOp::Add, path, value)
    }

    /// Creates a `replace` operation.
    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self::with_value(PatchOp::Replace, path, value)
    }

    /// Creates a `test` operation.
    pub fn test(path: impl Into<String>, value: Value) -> Self {
        Self::with_value(PatchOp::Test, path, value)
    }

    /// Creates a `remove` operation.
    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path: path.into(),
            from: None,
            value: None,
        }
    }

    /// Creates a `move` operation.
    pub fn move_from(from: impl Into<String>, path: impl Into<String>) -> Self {
        Self::with_from(PatchOp::Move, from, path)
    }

    /// Creates a `copy` operation.
    pub fn copy_from(from: impl Into<String>, path: impl Into<String>) -> Self {
        Self::with_from(PatchOp::Copy, from, path)
    }

    fn with_value(op: PatchOp, path: impl Into<String>, value: Value) -> Self {
        Self {
            op,
            path: path.into(),
            from: None,
            value: Some(value),
        }
    }

    fn with_from(op: PatchOp, from: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            op,
            path: path.into(),
            from: Some(from.into()),
            value: None,
        }
    }
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Applies one operation, returning the patched copy.
///
/// # Errors
///
/// Returns a [`PatchError`] if the operation cannot be applied. The input is
/// never modified.
pub fn apply(document: &Value, operation: &PatchOperation) -> Result<Value, PatchError> {
    let mut next = document.clone();
    apply_in_place(&mut next, operation)?;
    Ok(next)
}

/// Applies operations in order, returning the patched copy.
///
/// # Errors
///
/// Returns the first failing operation's error. The input is never modified.
pub fn apply_all(document: &Value, operations: &[PatchOperation]) -> Result<Value, PatchError> {
    let mut next = document.clone();
    for operation in operations {
        apply_in_place(&mut next, operation)?;
    }
    Ok(next)
}

fn apply_in_place(root: &mut Value, operation: &PatchOperation) -> Result<(), PatchError> {
    let path = operation.path.as_str();
    match operation.op {
        PatchOp::Add => add(root, path, required_value(operation)?),
        PatchOp::Remove => remove(root, path).map(|_| ()),
        PatchOp::Replace => {
            let value = required_value(operation)?;
            if path.is_empty() {
                *root = value;
                return Ok(());
            }
            remove(root, path)?;
            add(root, path, value)
        }
        PatchOp::Move => {
            let from = required_from(operation)?;
            let value = remove(root, from)?;
            add(root, path, value)
        }
        PatchOp::Copy => {
            let from = required_from(operation)?;
            let value = lookup(root, from)?.clone();
            add(root, path, value)
        }
        PatchOp::Test => {
            let expected = required_value(operation)?;
            if *lookup(root, path)? == expected {
                Ok(())
            } else {
                Err(PatchError::TestFailed(path.to_string()))
            }
        }
    }
}

fn required_value(operation: &PatchOperation) -> Result<Value, PatchError> {
    operation
        .value
        .clone()
        .ok_or(PatchError::MissingValue(operation.op))
}

fn required_from(operation: &PatchOperation) -> Result<&str, PatchError> {
    operation
        .from
        .as_deref()
        .ok_or(PatchError::MissingFrom(operation.op))
}

fn lookup<'a>(root: &'a Value, path: &str) -> Result<&'a Value, PatchError> {
    check_pointer(path)?;
    root.pointer(path)
        .ok_or_else(|| PatchError::PathNotFound(path.to_string()))
}

/// Splits a pointer into its parent pointer and unescaped last token.
fn split_parent(path: &str) -> Result<(&str, String), PatchError> {
    check_pointer(path)?;
    let idx = path
        .rfind('/')
        .ok_or_else(|| PatchError::InvalidPath(path.to_string()))?;
    let token = path[idx + 1..].replace("~1", "/").replace("~0", "~");
    Ok((&path[..idx], token))
}

fn check_pointer(path: &str) -> Result<(), PatchError> {
    if path.is_empty() || path.starts_with('/') {
        Ok(())
    } else {
        Err(PatchError::InvalidPath(path.to_string()))
    }
}

fn parent_mut<'a>(
    root: &'a mut Value,
    parent: &str,
    path: &str,
) -> Result<&'a mut Value, PatchError> {
    root.pointer_mut(parent)
        .ok_or_else(|| PatchError::PathNotFound(path.to_string()))
}

fn parse_index(token: &str, path: &str) -> Result<usize, PatchError> {
    token
        .parse::<usize>()
        .map_err(|_| PatchError::InvalidPath(path.to_string()))
}

fn add(root: &mut Value, path: &str, value: Value) -> Result<(), PatchError> {
    if path.is_empty() {
        *root = value;
        return Ok(());
    }
    let (parent, token) = split_parent(path)?;
    match parent_mut(root, parent, path)? {
        Value::Object(map) => {
            map.insert(token, value);
            Ok(())
        }
        Value::Array(items) => {
            if token == "-" {
                items.push(value);
                return Ok(());
            }
            let index = parse_index(&token, path)?;
            if index > items.len() {
                return Err(PatchError::IndexOutOfBounds {
                    path: path.to_string(),
                    index,
                    len: items.len(),
                });
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(PatchError::NotAContainer(parent.to_string())),
    }
}

fn remove(root: &mut Value, path: &str) -> Result<Value, PatchError> {
    if path.is_empty() {
        return Err(PatchError::InvalidPath(path.to_string()));
    }
    let (parent, token) = split_parent(path)?;
    match parent_mut(root, parent, path)? {
        Value::Object(map) => map
            .remove(&token)
            .ok_or_else(|| PatchError::PathNotFound(path.to_string())),
        Value::Array(items) => {
            let index = parse_index(&token, path)?;
            if index >= items.len() {
                return Err(PatchError::IndexOutOfBounds {
                    path: path.to_string(),
                    index,
                    len: items.len(),
                });
            }
            Ok(items.remove(index))
        }
        _ => Err(PatchError::NotAContainer(parent.to_string())),
    }
}
