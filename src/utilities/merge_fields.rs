//! Merge-field extraction and substitution.
//!
//! A merge field is a `{name}` placeholder inside a template string. Fields
//! are found with a non-greedy brace pattern: scanning left to right, each
//! `{` pairs with the nearest following `}`. There is no nesting, so
//! `"{a{b}}"` yields the single field `"a{b"` and leaves the trailing `}`
//! as literal text. An empty placeholder `{}` yields the empty field name.

use regex::{Captures, Regex};
use once_cell::sync::Lazy;
use serde_json::Value;

static MERGE_FIELD_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(.*?)\}").unwrap());

/// Extract the merge field names of `text` in order of occurrence.
///
/// Duplicates are preserved. `None` and the empty string yield an empty list.
pub fn extract_merge_fields(text: Option<&str>) -> Vec<String> {
    let text = match text {
        Some(t) if !t.is_empty() => t,
        _ => return Vec::new(),
    };
    MERGE_FIELD_PATTERN
        .captures_iter(text)
        .map(|cap| cap[1].to_string())
        .collect()
}

/// Extract merge fields from an arbitrary property value.
///
/// Only strings can carry placeholders; every other value has none.
pub fn extract_from_value(value: Option<&Value>) -> Vec<String> {
    extract_merge_fields(value.and_then(Value::as_str))
}

/// Replace every placeholder in `template` in a single pass.
///
/// `lookup` receives the field name and returns the replacement text, or
/// `None` to keep the placeholder as written.
pub fn substitute<F>(template: &str, mut lookup: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    MERGE_FIELD_PATTERN
        .replace_all(template, |cap: &Captures<'_>| {
            lookup(&cap[1]).unwrap_or_else(|| cap[0].to_string())
        })
        .into_owned()
}

/// Render a state value as merge text.
///
/// Strings are inserted verbatim, numbers and booleans in their plain form,
/// arrays as their comma-joined elements (null elements render empty) and
/// objects as `[object Object]`, the way a browser host stringifies them.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}
