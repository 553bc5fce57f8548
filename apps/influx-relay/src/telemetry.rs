use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Pre-shaped producer event (`{name, tags?, fields|value, zoneName?, ts?}`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Option<EventTags>,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub zone_name: Option<String>,
    #[serde(default)]
    pub ts: Option<EventTimestamp>,
}

/// Tag payload as producers send it: keyed map or legacy positional list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EventTags {
    Positional(Vec<String>),
    Named(BTreeMap<String, String>),
}

/// Device capability change.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub cap_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub zone_name: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub capability: Option<CapabilityMeta>,
    #[serde(default)]
    pub ts: Option<EventTimestamp>,
}

/// Declared unit and range of a capability.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CapabilityMeta {
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EventTimestamp {
    Int(i64),
    Float(f64),
    Str(String),
}

impl EventTimestamp {
    /// Epoch milliseconds or RFC 3339; anything unparseable falls back to now.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        match self {
            EventTimestamp::Str(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            EventTimestamp::Int(ms) => millis_to_dt(*ms),
            EventTimestamp::Float(ms) => millis_to_dt(*ms as i64),
        }
    }
}

impl From<DateTime<Utc>> for EventTimestamp {
    fn from(value: DateTime<Utc>) -> Self {
        EventTimestamp::Int(value.timestamp_millis())
    }
}

pub(crate) fn millis_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

/// What an MQTT publish carried, keyed by topic suffix.
#[derive(Debug)]
pub enum ProducerPayload {
    Events(Vec<Event>),
    Capability(CapabilityEvent),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<Event>),
    One(Event),
}

/// Decodes `{prefix}/events` (one event or an array) and `{prefix}/capability`.
/// Other topics yield `None`.
pub fn parse_mqtt_payload(
    topic_prefix: &str,
    topic: &str,
    payload: &mut [u8],
) -> Result<Option<ProducerPayload>> {
    let Some(suffix) = topic
        .strip_prefix(topic_prefix)
        .and_then(|rest| rest.strip_prefix('/'))
    else {
        return Ok(None);
    };

    match suffix {
        "events" => {
            let events = match simd_json::serde::from_slice::<OneOrMany>(payload)? {
                OneOrMany::Many(events) => events,
                OneOrMany::One(event) => vec![event],
            };
            Ok(Some(ProducerPayload::Events(events)))
        }
        "capability" => {
            let event: CapabilityEvent = simd_json::serde::from_slice(payload)?;
            Ok(Some(ProducerPayload::Capability(event)))
        }
        _ => Ok(None),
    }
}
