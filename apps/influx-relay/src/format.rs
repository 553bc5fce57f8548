//! Producer events -> [`Measurement`].
//!
//! Naming: spaces, non-breaking spaces and line breaks fold to `_` first, then
//! `,`, `=` and `"` are backslash-escaped. The configured prefix goes through the same treatment
//! and is prepended with no separator.

use crate::escape::escape_tag;
use crate::measurement::{FieldValue, Measurement, Tags};
use crate::telemetry::{CapabilityEvent, CapabilityMeta, Event, EventTags, EventTimestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementMode {
    #[default]
    ByName,
    ByZone,
    ByZoneName,
}

/// How `%` capabilities are normalised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentageScale {
    #[default]
    Default,
    /// `[0,1]` ranges are multiplied by 100.
    Int,
    /// `[0,100]` ranges are divided by 100.
    Float,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatOptions {
    #[serde(default)]
    pub measurement_mode: MeasurementMode,
    #[serde(default)]
    pub measurement_prefix: String,
    #[serde(default)]
    pub percentage_scale: PercentageScale,
}

/// Anything that can be named: an event name plus an optional zone.
pub struct NameSource<'a> {
    pub name: &'a str,
    pub zone_name: Option<&'a str>,
}

impl<'a> From<&'a Event> for NameSource<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            name: &event.name,
            zone_name: event.zone_name.as_deref(),
        }
    }
}

impl<'a> From<&'a CapabilityEvent> for NameSource<'a> {
    fn from(event: &'a CapabilityEvent) -> Self {
        Self {
            name: &event.name,
            zone_name: event.zone_name.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Formatter {
    options: FormatOptions,
}

impl Formatter {
    pub fn new(options: FormatOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &FormatOptions {
        &self.options
    }

    pub fn format_measurement_name<'a>(&self, source: impl Into<NameSource<'a>>) -> String {
        let source = source.into();
        let event_name = format_key(source.name);
        let name = match source.zone_name.filter(|zone| !zone.is_empty()) {
            Some(zone) => match self.options.measurement_mode {
                MeasurementMode::ByZone => format_key(zone),
                MeasurementMode::ByZoneName => format!("{}_{}", format_key(zone), event_name),
                MeasurementMode::ByName => event_name,
            },
            None => event_name,
        };
        if self.options.measurement_prefix.is_empty() {
            name
        } else {
            format!("{}{}", format_key(&self.options.measurement_prefix), name)
        }
    }

    pub fn format_field_value(
        &self,
        value: &Value,
        capability: Option<&CapabilityMeta>,
    ) -> Option<FieldValue> {
        match value {
            Value::Bool(flag) => Some(FieldValue::Boolean(*flag)),
            Value::String(text) => Some(FieldValue::String(text.clone())),
            Value::Number(number) => {
                let number = number.as_f64().filter(|n| n.is_finite())?;
                Some(FieldValue::Number(self.scale_percentage(number, capability)))
            }
            _ => None,
        }
    }

    fn scale_percentage(&self, value: f64, capability: Option<&CapabilityMeta>) -> f64 {
        let Some(meta) = capability.filter(|meta| meta.units.as_deref() == Some("%")) else {
            return value;
        };
        let range = (meta.min, meta.max);
        match self.options.percentage_scale {
            PercentageScale::Int if range == (Some(0.0), Some(1.0)) => value * 100.0,
            PercentageScale::Float if range == (Some(0.0), Some(100.0)) => value / 100.0,
            _ => value,
        }
    }

    /// `None` when the value is unsupported; the caller treats that as a no-op.
    pub fn from_capability(&self, event: &CapabilityEvent) -> Option<Measurement> {
        if !is_supported_value(&event.value) || event.cap_id.is_empty() {
            return None;
        }
        let value = self.format_field_value(&event.value, event.capability.as_ref())?;

        let mut tags = Vec::with_capacity(4);
        Tags::insert(&mut tags, "id".to_string(), clean_tag(&event.id));
        Tags::insert(&mut tags, "name".to_string(), format_key(&event.name));
        if let Some(zone_id) = event.zone_id.as_deref() {
            Tags::insert(&mut tags, "zoneId".to_string(), clean_tag(zone_id));
        }
        if let Some(zone) = event.zone_name.as_deref() {
            Tags::insert(&mut tags, "zone".to_string(), format_key(zone));
        }
        tags.retain(|(_, value)| !value.is_empty());

        Measurement::new(
            self.format_measurement_name(event),
            Tags::Named(tags),
            vec![(clean_tag(&event.cap_id), value)],
            Some(timestamp_or_now(event.ts.as_ref())),
        )
    }

    /// Maps a pre-shaped event. Only the naming rule applies; field values are
    /// carried over as-is, skipping the ones line protocol cannot express.
    pub fn from_event(&self, event: &Event) -> Option<Measurement> {
        let mut fields: Vec<(String, FieldValue)> = event
            .fields
            .iter()
            .filter(|(key, _)| !key.is_empty())
            .filter_map(|(key, value)| raw_field_value(value).map(|value| (clean_tag(key), value)))
            .collect();
        if fields.is_empty() {
            if let Some(value) = event.value.as_ref().and_then(raw_field_value) {
                fields.push(("value".to_string(), value));
            }
        }

        Measurement::new(
            self.format_measurement_name(event),
            event_tags(event.tags.as_ref()),
            fields,
            Some(timestamp_or_now(event.ts.as_ref())),
        )
    }

    pub fn from_events(&self, events: &[Event]) -> Vec<Measurement> {
        events
            .iter()
            .filter_map(|event| self.from_event(event))
            .collect()
    }

    /// Single `value` field measurement from a bare scalar.
    pub fn from_value(&self, measurement_name: &str, value: &Value) -> Option<Measurement> {
        if measurement_name.is_empty() || !is_supported_value(value) {
            return None;
        }
        let value = self.format_field_value(value, None)?;
        let source = NameSource {
            name: measurement_name,
            zone_name: None,
        };
        Measurement::new(
            self.format_measurement_name(source),
            Tags::default(),
            vec![("value".to_string(), value)],
            Some(Utc::now()),
        )
    }
}

/// Booleans, finite numbers and strings. Everything else is rejected.
pub fn is_supported_value(value: &Value) -> bool {
    match value {
        Value::Bool(_) | Value::String(_) => true,
        Value::Number(number) => number.as_f64().is_some_and(f64::is_finite),
        _ => false,
    }
}

pub fn format_key(value: &str) -> String {
    let folded: String = value
        .chars()
        .map(|ch| match ch {
            ' ' | '\u{00A0}' | '\n' | '\r' => '_',
            _ => ch,
        })
        .collect();
    escape_tag(&folded).replace('"', "\\\"")
}

fn raw_field_value(value: &Value) -> Option<FieldValue> {
    match value {
        Value::Bool(flag) => Some(FieldValue::Boolean(*flag)),
        Value::Number(number) => number.as_f64().map(FieldValue::Number),
        Value::String(text) => Some(FieldValue::String(text.clone())),
        _ => None,
    }
}

/// Tag keys/values and field keys: line breaks and non-breaking spaces become
/// plain spaces before escaping, so a record never spans two lines.
fn clean_tag(value: &str) -> String {
    let folded: String = value
        .chars()
        .map(|ch| match ch {
            '\u{00A0}' | '\n' | '\r' => ' ',
            _ => ch,
        })
        .collect();
    escape_tag(&folded)
}

/// Empty keys and values are dropped; line protocol has no empty tag.
fn event_tags(tags: Option<&EventTags>) -> Tags {
    match tags {
        None => Tags::default(),
        Some(EventTags::Positional(values)) => Tags::Positional(
            values
                .iter()
                .filter(|value| !value.is_empty())
                .map(|value| clean_tag(value))
                .collect(),
        ),
        Some(EventTags::Named(map)) => {
            let mut pairs = Vec::with_capacity(map.len());
            for (key, value) in map {
                if key.is_empty() || value.is_empty() {
                    continue;
                }
                Tags::insert(&mut pairs, clean_tag(key), clean_tag(value));
            }
            Tags::Named(pairs)
        }
    }
}

fn timestamp_or_now(ts: Option<&EventTimestamp>) -> DateTime<Utc> {
    ts.map(EventTimestamp::to_datetime).unwrap_or_else(Utc::now)
}
