//! Token escaping for line protocol and InfluxQL.
//!
//! Every function is total and not idempotent: escape a token exactly once.
//!
//! The formatter only needs [`escape_tag`] (measurement names go through
//! `format::format_key`) and the adapter only needs [`quoted`].
//! [`escape_measurement`] and [`string_literal`] are exported for library
//! callers that compose their own lines or InfluxQL statements.

/// Measurement names: `,` and space.
pub fn escape_measurement(value: &str) -> String {
    escape_chars(value, &[',', ' '])
}

/// Tag keys and values: `,`, `=` and space.
pub fn escape_tag(value: &str) -> String {
    escape_chars(value, &[',', '=', ' '])
}

/// Double-quoted identifier, e.g. a database name inside `CREATE DATABASE`.
pub fn quoted(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Single-quoted InfluxQL string literal.
pub fn string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "\\'"))
}

fn escape_chars(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
