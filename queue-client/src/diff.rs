//! Incremental output edits for diff-streaming protocols.
//!
//! After the first `process_generating` message, each output slot arrives as a
//! list of `[action, path, value]` edits against the previous value of that
//! slot. Paths are arrays of object keys and array indices.

use serde_json::Value as JsonValue;

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Replace,
    Append,
    Add,
    Delete,
}

impl Action {
    fn parse(value: &JsonValue) -> ClientResult<Self> {
        match value.as_str() {
            Some("replace") => Ok(Action::Replace),
            Some("append") => Ok(Action::Append),
            Some("add") => Ok(Action::Add),
            Some("delete") => Ok(Action::Delete),
            _ => Err(ClientError::Protocol(format!("Unknown diff action: {}", value))),
        }
    }
}

/// Apply a list of edits to `target`, returning the new value.
pub fn apply_diff(mut target: JsonValue, edits: &JsonValue) -> ClientResult<JsonValue> {
    let edits = edits
        .as_array()
        .ok_or_else(|| ClientError::Protocol(format!("Diff is not a list: {}", edits)))?;
    for edit in edits {
        let parts = edit
            .as_array()
            .filter(|p| p.len() == 3)
            .ok_or_else(|| ClientError::Protocol(format!("Malformed diff edit: {}", edit)))?;
        let action = Action::parse(&parts[0])?;
        let path = parts[1]
            .as_array()
            .ok_or_else(|| ClientError::Protocol(format!("Malformed diff path: {}", parts[1])))?;
        target = apply_edit(target, action, path, parts[2].clone())?;
    }
    Ok(target)
}

/// Per-job diff state: the last full value of every output slot.
#[derive(Debug, Default)]
pub struct DiffState {
    previous: Option<Vec<JsonValue>>,
}

impl DiffState {
    /// The first message carries full outputs; later ones carry edits per slot.
    pub fn apply(&mut self, data: Vec<JsonValue>) -> ClientResult<Vec<JsonValue>> {
        let Some(previous) = self.previous.as_mut() else {
            self.previous = Some(data.clone());
            return Ok(data);
        };
        let mut current = Vec::with_capacity(data.len());
        for (i, edits) in data.iter().enumerate() {
            let base = previous.get(i).cloned().unwrap_or(JsonValue::Null);
            current.push(apply_diff(base, edits)?);
        }
        *previous = current.clone();
        Ok(current)
    }
}

fn apply_edit(
    mut target: JsonValue,
    action: Action,
    path: &[JsonValue],
    value: JsonValue,
) -> ClientResult<JsonValue> {
    let Some((last, parents)) = path.split_last() else {
        return match action {
            Action::Replace => Ok(value),
            Action::Append => append(&mut target, value).map(|_| target),
            _ => Err(ClientError::Protocol(format!(
                "Action {:?} needs a non-empty path",
                action
            ))),
        };
    };

    let mut current = &mut target;
    for key in parents {
        current = child_mut(current, key)?;
    }

    match action {
        Action::Replace => *child_mut(current, last)? = value,
        Action::Append => append(child_mut(current, last)?, value)?,
        Action::Add => match (current, last) {
            (JsonValue::Array(items), JsonValue::Number(n)) => {
                let index = index_of(n, items.len() + 1)?;
                items.insert(index, value);
            }
            (JsonValue::Object(map), JsonValue::String(key)) => {
                map.insert(key.clone(), value);
            }
            (_, key) => return Err(bad_path(key)),
        },
        Action::Delete => match (current, last) {
            (JsonValue::Array(items), JsonValue::Number(n)) => {
                let index = index_of(n, items.len())?;
                items.remove(index);
            }
            (JsonValue::Object(map), JsonValue::String(key)) => {
                map.remove(key);
            }
            (_, key) => return Err(bad_path(key)),
        },
    }
    Ok(target)
}

fn child_mut<'a>(value: &'a mut JsonValue, key: &JsonValue) -> ClientResult<&'a mut JsonValue> {
    match (value, key) {
        (JsonValue::Array(items), JsonValue::Number(n)) => {
            let index = index_of(n, items.len())?;
            Ok(&mut items[index])
        }
        (JsonValue::Object(map), JsonValue::String(k)) => {
            map.get_mut(k).ok_or_else(|| bad_path(key))
        }
        _ => Err(bad_path(key)),
    }
}

fn append(target: &mut JsonValue, value: JsonValue) -> ClientResult<()> {
    match (target, value) {
        (JsonValue::String(s), JsonValue::String(tail)) => s.push_str(&tail),
        (JsonValue::Array(items), JsonValue::Array(tail)) => items.extend(tail),
        (JsonValue::Array(items), value) => items.push(value),
        (target, value) => {
            return Err(ClientError::Protocol(format!(
                "Cannot append {} to {}",
                value, target
            )))
        }
    }
    Ok(())
}

/// Index into a sequence of `len` slots; negative indices count from the end.
fn index_of(n: &serde_json::Number, len: usize) -> ClientResult<usize> {
    let raw = n
        .as_i64()
        .ok_or_else(|| ClientError::Protocol(format!("Bad diff index: {}", n)))?;
    let index = if raw < 0 { len as i64 + raw } else { raw };
    if index < 0 || index as usize >= len {
        return Err(ClientError::Protocol(format!("Diff index out of range: {}", n)));
    }
    Ok(index as usize)
}

fn bad_path(key: &JsonValue) -> ClientError {
    ClientError::Protocol(format!("Diff path does not resolve at {}", key))
}
