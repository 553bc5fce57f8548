use crate::measurement::{Measurement, Tags};
use std::fmt::Write;

/// `name[,key=value]* field=value[,field=value]*[ epoch_ms]`
///
/// Tokens are already escaped by the formatter; this only joins them.
pub fn render_line(measurement: &Measurement) -> String {
    let mut line = String::with_capacity(64);
    line.push_str(measurement.name());

    match measurement.tags() {
        Tags::Named(pairs) => {
            for (key, value) in pairs {
                let _ = write!(line, ",{key}={value}");
            }
        }
        Tags::Positional(values) => {
            for (idx, value) in values.iter().enumerate() {
                let _ = write!(line, ",tag_{idx}={value}");
            }
        }
    }

    line.push(' ');
    for (idx, (key, value)) in measurement.fields().iter().enumerate() {
        if idx > 0 {
            line.push(',');
        }
        let _ = write!(line, "{key}={value}");
    }

    if let Some(ts) = measurement.timestamp() {
        let _ = write!(line, " {}", ts.timestamp_millis());
    }
    line
}

/// One line per measurement, in slice order.
pub fn render_batch(measurements: &[Measurement]) -> String {
    measurements
        .iter()
        .map(render_line)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FormatOptions, Formatter, MeasurementMode};
    use crate::telemetry::{CapabilityEvent, CapabilityMeta, Event, EventTags, EventTimestamp};
    use serde_json::{json, Map};
    use std::collections::BTreeMap;

    #[test]
    fn capability_line_carries_tags_field_and_millis() {
        let event = CapabilityEvent {
            id: "dev 1".to_string(),
            cap_id: "measure_temperature".to_string(),
            name: "Hall Sensor".to_string(),
            zone_id: Some("z1".to_string()),
            zone_name: Some("Ground Floor".to_string()),
            value: json!(21.5),
            capability: Some(CapabilityMeta::default()),
            ts: Some(EventTimestamp::Int(1_700_000_000_000)),
        };
        let measurement = Formatter::default().from_capability(&event).expect("measurement");
        assert_eq!(
            render_line(&measurement),
            "Hall_Sensor,id=dev\\ 1,name=Hall_Sensor,zoneId=z1,zone=Ground_Floor \
             measure_temperature=21.5 1700000000000"
        );
    }

    #[test]
    fn positional_tags_render_with_synthesized_keys() {
        let mut fields = Map::new();
        fields.insert("average_1".to_string(), json!(0.5));
        fields.insert("average_5".to_string(), json!(0.25));
        let event = Event {
            name: "cpu_load".to_string(),
            tags: Some(EventTags::Positional(vec!["hub".to_string(), "cpu".to_string()])),
            fields,
            ts: Some(EventTimestamp::Int(5)),
            ..Event::default()
        };
        let measurement = Formatter::default().from_event(&event).expect("measurement");
        assert_eq!(
            render_line(&measurement),
            "cpu_load,tag_0=hub,tag_1=cpu average_1=0.5,average_5=0.25 5"
        );
    }

    #[test]
    fn string_fields_are_quoted_and_named_tags_escaped() {
        let mut tags = BTreeMap::new();
        tags.insert("room".to_string(), "Living room".to_string());
        let mut fields = Map::new();
        fields.insert("state".to_string(), json!("on=\"yes\""));
        let event = Event {
            name: "lamp".to_string(),
            tags: Some(EventTags::Named(tags)),
            fields,
            ts: Some(EventTimestamp::Int(7)),
            ..Event::default()
        };
        let measurement = Formatter::default().from_event(&event).expect("measurement");
        assert_eq!(
            render_line(&measurement),
            "lamp,room=Living\\ room state=\"on=\\\"yes\\\"\" 7"
        );
    }

    #[test]
    fn empty_tags_and_field_keys_are_left_out() {
        let mut tags = BTreeMap::new();
        tags.insert("room".to_string(), String::new());
        tags.insert(String::new(), "orphan".to_string());
        tags.insert("floor".to_string(), "1".to_string());
        let mut fields = Map::new();
        fields.insert(String::new(), json!(2));
        fields.insert("value".to_string(), json!(1));
        let event = Event {
            name: "x".to_string(),
            tags: Some(EventTags::Named(tags)),
            fields,
            ts: Some(EventTimestamp::Int(3)),
            ..Event::default()
        };
        let measurement = Formatter::default().from_event(&event).expect("measurement");
        assert_eq!(render_line(&measurement), "x,floor=1 value=1 3");

        let event = Event {
            name: "x".to_string(),
            tags: Some(EventTags::Positional(vec![
                "hub".to_string(),
                String::new(),
                "cpu".to_string(),
            ])),
            value: Some(json!(1)),
            ts: Some(EventTimestamp::Int(3)),
            ..Event::default()
        };
        let measurement = Formatter::default().from_event(&event).expect("measurement");
        assert_eq!(render_line(&measurement), "x,tag_0=hub,tag_1=cpu value=1 3");
    }

    #[test]
    fn line_breaks_in_names_and_tags_stay_on_one_line() {
        let mut tags = BTreeMap::new();
        tags.insert("room".to_string(), "Living\nroom".to_string());
        let mut fields = Map::new();
        fields.insert("on\rstate".to_string(), json!(true));
        let event = Event {
            name: "Hall\nLamp".to_string(),
            tags: Some(EventTags::Named(tags)),
            fields,
            zone_name: Some("Ground\r\nFloor".to_string()),
            ts: Some(EventTimestamp::Int(9)),
            ..Event::default()
        };
        let fmt = Formatter::new(FormatOptions {
            measurement_mode: MeasurementMode::ByZoneName,
            ..FormatOptions::default()
        });
        let line = render_line(&fmt.from_event(&event).expect("measurement"));
        assert_eq!(
            line,
            "Ground__Floor_Hall_Lamp,room=Living\\ room on\\ state=true 9"
        );
        assert_eq!(render_batch(&[fmt.from_event(&event).expect("again")]).lines().count(), 1);

        let capability = CapabilityEvent {
            id: "dev\n1".to_string(),
            cap_id: "onoff".to_string(),
            name: "Lamp".to_string(),
            value: json!(true),
            ts: Some(EventTimestamp::Int(9)),
            ..CapabilityEvent::default()
        };
        let line = render_line(&Formatter::default().from_capability(&capability).expect("capability"));
        assert_eq!(line, "Lamp,id=dev\\ 1,name=Lamp onoff=true 9");
    }

    #[test]
    fn batch_preserves_order_one_line_each() {
        let fmt = Formatter::default();
        let batch: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|name| fmt.from_value(name, &json!(true)).expect("measurement"))
            .collect();
        let body = render_batch(&batch);
        let names: Vec<&str> = body
            .lines()
            .map(|line| line.split(' ').next().unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(body.lines().all(|line| line.contains(" value=true ")));
    }
}
