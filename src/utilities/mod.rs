//! Utility modules.

pub mod merge_fields;

pub use merge_fields::{extract_merge_fields, render_value, substitute};
