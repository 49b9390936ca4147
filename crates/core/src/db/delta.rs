use serde_json::Value;

use super::JsonMap;
use crate::error::SyncError;

/// Apply a revision delta to a base body, in place.
///
/// The supported patch grammar mirrors what the storage layer's diff engine
/// emits: a JSON object whose members mean
///
/// * `"key": [v]` — insert or replace `key` with `v`,
/// * `"key": []` — delete `key`,
/// * `"key": {…}` — recurse into the nested object under `key`.
///
/// Anything else (patching through a non-object, multi-element arrays) is a
/// malformed patch and fails; the caller maps that to a transient error.
pub fn apply_delta(base: &mut JsonMap, delta: &Value) -> Result<(), SyncError> {
    let Some(delta) = delta.as_object() else {
        return Err(SyncError::internal("delta is not a JSON object"));
    };
    for (key, op) in delta {
        match op {
            Value::Array(items) => match items.as_slice() {
                [] => {
                    base.remove(key);
                }
                [new_value] => {
                    base.insert(key.clone(), new_value.clone());
                }
                _ => {
                    return Err(SyncError::internal(format!(
                        "unsupported delta operation for key {key:?}"
                    )));
                }
            },
            Value::Object(_) => {
                let Some(Value::Object(nested)) = base.get_mut(key) else {
                    return Err(SyncError::internal(format!(
                        "delta recurses into {key:?}, which is not an object in the base"
                    )));
                };
                apply_delta(nested, op)?;
            }
            _ => {
                return Err(SyncError::internal(format!(
                    "unsupported delta operation for key {key:?}"
                )));
            }
        }
    }
    Ok(())
}
