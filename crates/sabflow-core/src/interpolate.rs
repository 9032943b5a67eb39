//! `{{variable}}` template substitution over the execution variable store.
//!
//! Placeholders hold a single identifier with optional surrounding whitespace
//! (`{{ name }}`). Dotted and bracketed identifiers reach into structured
//! values (`{{apiResult.body.balance}}`). Unresolved placeholders stay in the
//! output verbatim so operators can spot them in delivered messages.

use crate::response_path;
use serde_json::Value;
use std::collections::HashMap;

/// Render `template`, substituting `{{ident}}` placeholders from `variables`.
pub fn render(template: &str, variables: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                out.push_str(&rest[..open]);
                let raw = &after_open[..close];
                let ident = raw.trim();
                match lookup(ident, variables) {
                    Some(value) => out.push_str(&value_to_string(value)),
                    None => {
                        // Leave the placeholder as written, not as trimmed
                        out.push_str("{{");
                        out.push_str(raw);
                        out.push_str("}}");
                    }
                }
                rest = &after_open[close + 2..];
            }
            None => break, // no closing braces; emit the tail untouched
        }
    }
    out.push_str(rest);
    out
}

/// Resolve an identifier against the store. Plain names hit the map directly;
/// dotted or bracketed names traverse into the stored value.
fn lookup<'a>(ident: &str, variables: &'a HashMap<String, Value>) -> Option<&'a Value> {
    if ident.is_empty() {
        return None;
    }
    if let Some(value) = variables.get(ident) {
        return Some(value);
    }

    let head_end = ident
        .find(|c| c == '.' || c == '[')
        .unwrap_or(ident.len());
    if head_end == ident.len() {
        return None;
    }
    let (head, tail) = ident.split_at(head_end);
    let root = variables.get(head)?;
    let path = tail.strip_prefix('.').unwrap_or(tail);
    response_path::extract(root, path)
}

/// String form of a variable value: strings render bare, everything else
/// renders as compact JSON (so a stored `42` interpolates as `42`).
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
