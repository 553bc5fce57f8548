use chrono::{DateTime, Utc};
use std::fmt;

/// A single field payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Boolean(bool),
    Number(f64),
    /// Raw text; quoted when rendered.
    String(String),
}

impl FieldValue {
    /// Line protocol rendering: numbers and booleans literal, strings double-quoted
    /// with `\` and `"` backslash-escaped.
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Boolean(value) => value.to_string(),
            FieldValue::Number(value) => format!("{value}"),
            FieldValue::String(value) => {
                let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{escaped}\"")
            }
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line_protocol())
    }
}

/// Tag set in either keyed or legacy positional form.
///
/// Positional values are rendered as `tag_0`, `tag_1`, ... at serialization time.
#[derive(Debug, Clone, PartialEq)]
pub enum Tags {
    Named(Vec<(String, String)>),
    Positional(Vec<String>),
}

impl Default for Tags {
    fn default() -> Self {
        Tags::Named(Vec::new())
    }
}

impl Tags {
    pub fn is_empty(&self) -> bool {
        match self {
            Tags::Named(pairs) => pairs.is_empty(),
            Tags::Positional(values) => values.is_empty(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            Tags::Named(pairs) => pairs
                .iter()
                .find(|(existing, _)| existing == key)
                .map(|(_, value)| value.as_str()),
            Tags::Positional(values) => key
                .strip_prefix("tag_")
                .and_then(|idx| idx.parse::<usize>().ok())
                .and_then(|idx| values.get(idx))
                .map(String::as_str),
        }
    }

    /// Keyed insert; replaces an existing key so keys stay unique.
    pub(crate) fn insert(pairs: &mut Vec<(String, String)>, key: String, value: String) {
        if let Some(slot) = pairs.iter_mut().find(|(existing, _)| *existing == key) {
            slot.1 = value;
        } else {
            pairs.push((key, value));
        }
    }
}

/// One named, timestamped set of tagged field values.
///
/// Built only by [`crate::format::Formatter`]; every token it carries is already
/// escaped for line protocol, so serialization is plain concatenation.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    name: String,
    tags: Tags,
    fields: Vec<(String, FieldValue)>,
    timestamp: Option<DateTime<Utc>>,
}

impl Measurement {
    pub(crate) fn new(
        name: String,
        tags: Tags,
        fields: Vec<(String, FieldValue)>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Option<Self> {
        if name.is_empty() || fields.is_empty() {
            return None;
        }
        Some(Self {
            name,
            tags,
            fields,
            timestamp,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}
