//! Flat dotted-key configuration expansion.
//!
//! Editors store preferences as flat dot-qualified keys
//! (`"bosh.cli.target"`); the server wants a nested object tree. Each key is
//! split on `.` and merged into nested objects, recursively, so dotted keys
//! buried inside object values expand too.
//!
//! Conflicts (the same segment used both as a leaf and as a prefix) are
//! resolved by letting the later expansion win: a deeper key replaces a
//! primitive with a fresh object, and a later leaf replaces an object.

use serde_json::{Map, Value};

/// Expand every dotted key in `settings` into nested objects.
///
/// Non-object values are returned as-is (deep copy); an object with no
/// dotted keys comes back structurally unchanged.
pub fn expand_settings(settings: &Value) -> Value {
    match settings {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                insert_expanded(&mut out, key, expand_settings(value));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn insert_expanded(target: &mut Map<String, Value>, dotted_key: &str, value: Value) {
    match dotted_key.split_once('.') {
        None => merge_leaf(target, dotted_key, value),
        Some((head, rest)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match child {
                Value::Object(child) => insert_expanded(child, rest, value),
                other => {
                    // A deeper key forces this segment to be an object.
                    let mut fresh = Map::new();
                    insert_expanded(&mut fresh, rest, value);
                    *other = Value::Object(fresh);
                }
            }
        }
    }
}

fn merge_leaf(target: &mut Map<String, Value>, key: &str, value: Value) {
    match value {
        Value::Object(incoming) => {
            let slot = target
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match slot {
                Value::Object(existing) => {
                    for (k, v) in incoming {
                        insert_expanded(existing, &k, v);
                    }
                }
                other => *other = Value::Object(incoming),
            }
        }
        value => {
            target.insert(key.to_string(), value);
        }
    }
}
