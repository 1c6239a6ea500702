//! Merge semantics for mutable-payload (BILL/POLL) message metadata.
//!
//! A patch never replaces the stored object wholesale: objects merge key by
//! key, arrays behave as ordered sets, scalars overwrite. Applying the same
//! patch twice therefore yields the same result as applying it once, which is
//! what makes at-least-once command delivery safe here.

use serde_json::Value;
use shared::protocol::Metadata;

pub fn merge_patch(target: &mut Metadata, patch: &Metadata) {
    for (key, incoming) in patch {
        let merged = match target.remove(key) {
            Some(existing) => merge_value(existing, incoming),
            None => incoming.clone(),
        };
        target.insert(key.clone(), merged);
    }
}

fn merge_value(existing: Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Object(mut current), Value::Object(patch)) => {
            merge_patch(&mut current, patch);
            Value::Object(current)
        }
        (Value::Array(mut current), Value::Array(additions)) => {
            for item in additions {
                if !current.contains(item) {
                    current.push(item.clone());
                }
            }
            Value::Array(current)
        }
        (_, value) => value.clone(),
    }
}
