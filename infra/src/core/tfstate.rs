//! Minimal inspection of backend state snapshots.
//!
//! Snapshots are opaque to the cache; only post-condition checks look inside.

use serde_json::Value;

/// Number of managed resources recorded in a state snapshot.
///
/// Data sources (`"mode": "data"`) are not counted. Returns `None` when the
/// snapshot is not a JSON document with a `resources` array.
pub fn managed_resource_count(state: &[u8]) -> Option<usize> {
    let value: Value = serde_json::from_slice(state).ok()?;
    let resources = value.get("resources")?.as_array()?;
    Some(
        resources
            .iter()
            .filter(|res| res.get("mode").and_then(Value::as_str) != Some("data"))
            .count(),
    )
}
