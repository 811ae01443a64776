//! Deep-merge for configuration layers
//!
//! Merge semantics:
//! - Maps: merged key-by-key, recursively
//! - Sequences: concatenated (incoming appended)
//! - Scalar slots: replaced with the incoming value's text form
//! - Shape changes (scalar vs. container): incoming replaces wholesale

use serde_json::{Map, Value};

/// Merge `overlay` into `base`, key by key.
pub(crate) fn merge_maps(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, incoming) in overlay {
        match base.get_mut(key) {
            Some(existing) => merge_slot(existing, incoming),
            None => {
                base.insert(key.clone(), incoming.clone());
            }
        }
    }
}

fn merge_slot(existing: &mut Value, incoming: &Value) {
    match (&mut *existing, incoming) {
        (Value::Object(base), Value::Object(overlay)) => merge_maps(base, overlay),
        (Value::Array(base), Value::Array(overlay)) => base.extend(overlay.iter().cloned()),
        (Value::Object(_) | Value::Array(_), _) => *existing = incoming.clone(),
        (_, _) => *existing = scalar_override(incoming),
    }
}

/// The value written over an existing scalar slot.
///
/// Scalars arrive stringified so later layers behave uniformly whether a
/// port was written as `1501` or `"1501"`; containers and null replace
/// structurally.
fn scalar_override(incoming: &Value) -> Value {
    match incoming {
        Value::String(text) => Value::String(text.clone()),
        Value::Number(number) => Value::String(number.to_string()),
        Value::Bool(flag) => Value::String(flag.to_string()),
        other => other.clone(),
    }
}
