//! Dot/bracket path extraction over JSON values.
//!
//! Paths are dot-separated segments with optional `[idx]` array indexing,
//! e.g. `data.items[1].name`. A path that does not resolve yields `None`;
//! extraction never errors.

use serde_json::Value;

/// Extract the value at `path` inside `root`, if present.
pub fn extract<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }

    let mut current = root;
    for segment in path.split('.') {
        current = apply_segment(current, segment)?;
    }
    Some(current)
}

/// Apply one dot-segment, e.g. `items[0][1]` = key lookup then two indexes.
fn apply_segment<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    let key_end = segment.find('[').unwrap_or(segment.len());
    let (key, mut brackets) = segment.split_at(key_end);

    let mut current = if key.is_empty() {
        value
    } else {
        value.as_object()?.get(key)?
    };

    while let Some(rest) = brackets.strip_prefix('[') {
        let close = rest.find(']')?;
        let index: usize = rest[..close].parse().ok()?;
        current = current.as_array()?.get(index)?;
        brackets = &rest[close + 1..];
    }

    if brackets.is_empty() {
        Some(current)
    } else {
        None
    }
}
