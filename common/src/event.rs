use serde::{ser::SerializeMap, Serialize, Serializer};
use serde_json::value::RawValue;

use crate::names::FIELD_ERR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Sensors,
    Sonoff,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sensors => "sensors",
            Self::Sonoff => "sonoff",
        }
    }
}

/// A single payload value.
///
/// `Fixed2` always renders with two decimals (`21.50`) and `Flag` renders
/// as `0`/`1`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Fixed2(f64),
    Int(i64),
    Flag(bool),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Fixed2(value) => Some(*value),
            Self::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Fixed2(value) if value.is_finite() => {
                let raw = RawValue::from_string(format!("{value:.2}"))
                    .map_err(serde::ser::Error::custom)?;
                raw.serialize(serializer)
            }
            Self::Fixed2(_) => serializer.serialize_none(),
            Self::Int(value) => serializer.serialize_i64(*value),
            Self::Flag(value) => serializer.serialize_u8(u8::from(*value)),
            Self::Text(value) => serializer.serialize_str(value),
        }
    }
}

/// Structured record emitted for every reading or state change.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub device_id: String,
    pub device_type: DeviceType,
    pub sensor: Option<String>,
    pub fields: Vec<(String, FieldValue)>,
}

pub fn build_event(
    device_id: &str,
    device_type: DeviceType,
    sensor: Option<&str>,
    fields: Vec<(&str, FieldValue)>,
) -> Event {
    Event {
        device_id: device_id.to_string(),
        device_type,
        sensor: sensor.map(str::to_string),
        fields: fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    }
}

impl Event {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn has_error(&self) -> bool {
        self.field(FIELD_ERR).is_some()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = 2 + usize::from(self.sensor.is_some()) + self.fields.len();
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("device_id", &self.device_id)?;
        map.serialize_entry("device_type", &self.device_type)?;
        if let Some(sensor) = &self.sensor {
            map.serialize_entry("sensor", sensor)?;
        }
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn keys_follow_wire_order() {
        let event = build_event(
            "dev1",
            DeviceType::Sensors,
            Some("dht1"),
            vec![
                ("temp", FieldValue::Fixed2(21.5)),
                ("humidity", FieldValue::Fixed2(40.12)),
            ],
        );

        assert_eq!(
            event.to_json().unwrap(),
            r#"{"device_id":"dev1","device_type":"sensors","sensor":"dht1","temp":21.50,"humidity":40.12}"#
        );
    }

    #[test]
    fn sensor_key_is_omitted_when_absent() {
        let event = build_event(
            "plug",
            DeviceType::Sonoff,
            None,
            vec![("relay_on", FieldValue::Flag(true))],
        );

        assert_eq!(
            event.to_json().unwrap(),
            r#"{"device_id":"plug","device_type":"sonoff","relay_on":1}"#
        );
    }

    #[test]
    fn integer_and_text_values() {
        let event = build_event(
            "dev\"1",
            DeviceType::Sensors,
            Some("light1"),
            vec![
                ("level", FieldValue::Int(-3)),
                ("err", FieldValue::Text("line \"1\"\n".to_string())),
            ],
        );

        assert_eq!(
            event.to_json().unwrap(),
            r#"{"device_id":"dev\"1","device_type":"sensors","sensor":"light1","level":-3,"err":"line \"1\"\n"}"#
        );
    }

    #[test]
    fn non_finite_fixed_values_become_null() {
        let event = build_event(
            "dev1",
            DeviceType::Sensors,
            None,
            vec![
                ("temp", FieldValue::Fixed2(f64::NAN)),
                ("humidity", FieldValue::Fixed2(f64::INFINITY)),
            ],
        );

        assert_eq!(
            event.to_json().unwrap(),
            r#"{"device_id":"dev1","device_type":"sensors","temp":null,"humidity":null}"#
        );
    }

    #[test]
    fn serialized_payload_parses_as_json() {
        let event = build_event(
            "dev1",
            DeviceType::Sensors,
            Some("dht1"),
            vec![
                ("temp", FieldValue::Fixed2(-4.0)),
                ("humidity", FieldValue::Fixed2(99.999)),
            ],
        );

        let parsed: serde_json::Value = serde_json::from_slice(&event.to_vec().unwrap()).unwrap();
        assert_eq!(parsed["temp"], serde_json::json!(-4.0));
        assert_eq!(parsed["humidity"], serde_json::json!(100.0));
    }

    #[test]
    fn error_detection() {
        let ok = build_event(
            "dev1",
            DeviceType::Sensors,
            Some("dht1"),
            vec![("temp", FieldValue::Fixed2(20.0))],
        );
        let failed = build_event(
            "dev1",
            DeviceType::Sensors,
            Some("dht1"),
            vec![("err", FieldValue::Text("timeout".to_string()))],
        );

        assert!(!ok.has_error());
        assert!(failed.has_error());
        assert_eq!(failed.field("err").and_then(FieldValue::as_text), Some("timeout"));
        assert_eq!(ok.field("temp").and_then(FieldValue::as_f64), Some(20.0));
    }
}
