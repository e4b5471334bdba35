//! `pilot-types` – shared vocabulary of the PILOT Drive backend.
//!
//! - [`EventTag`] – the closed set of channels a Service emits on and the UI
//!   groups messages by.
//! - [`Event`] – one tagged, opaque payload.  On the wire it is the envelope
//!   `{"type": "<tag>", "<tag>": <payload>}` in both directions.
//! - [`PilotError`] – the workspace-wide error type.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Identifies both the producing Service and the UI-side channel of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventTag {
    Bluetooth,
    Settings,
    Phone,
    System,
    Vehicle,
    Media,
    Web,
    Camera,
    Updater,
}

impl EventTag {
    /// Every tag, in declaration order.
    pub const ALL: [EventTag; 9] = [
        EventTag::Bluetooth,
        EventTag::Settings,
        EventTag::Phone,
        EventTag::System,
        EventTag::Vehicle,
        EventTag::Media,
        EventTag::Web,
        EventTag::Camera,
        EventTag::Updater,
    ];

    /// The wire name of the tag.
    pub fn as_str(self) -> &'static str {
        match self {
            EventTag::Bluetooth => "bluetooth",
            EventTag::Settings => "settings",
            EventTag::Phone => "phone",
            EventTag::System => "system",
            EventTag::Vehicle => "vehicle",
            EventTag::Media => "media",
            EventTag::Web => "web",
            EventTag::Camera => "camera",
            EventTag::Updater => "updater",
        }
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventTag {
    type Err = PilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| PilotError::UnknownTag(s.to_string()))
    }
}

/// A tagged event travelling Service → UI, or a command travelling UI →
/// Service.  The payload shape is tag-specific and opaque to the core.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub tag: EventTag,
    pub payload: Value,
}

impl Event {
    pub fn new(tag: EventTag, payload: Value) -> Self {
        Self { tag, payload }
    }

    /// Build the `{"type": tag, tag: payload}` envelope.
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(2);
        map.insert("type".to_string(), Value::String(self.tag.as_str().to_string()));
        map.insert(self.tag.as_str().to_string(), self.payload.clone());
        Value::Object(map)
    }

    /// Serialise into a JSON text frame.
    pub fn to_frame(&self) -> Result<String, PilotError> {
        serde_json::to_string(self).map_err(|e| PilotError::MalformedFrame(e.to_string()))
    }

    /// Parse a JSON text frame.
    ///
    /// A frame whose `<type>` key is absent yields a `null` payload.
    ///
    /// # Errors
    ///
    /// [`PilotError::MalformedFrame`] for invalid JSON, a non-object frame or
    /// a missing `type`; [`PilotError::UnknownTag`] when `type` names no
    /// [`EventTag`].
    pub fn from_frame(text: &str) -> Result<Self, PilotError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| PilotError::MalformedFrame(e.to_string()))?;
        Self::from_value(value)
    }

    /// Interpret an already-decoded JSON value as an envelope.
    pub fn from_value(value: Value) -> Result<Self, PilotError> {
        match value {
            Value::Object(map) => Self::from_map(map),
            other => Err(PilotError::MalformedFrame(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    fn from_map(mut map: Map<String, Value>) -> Result<Self, PilotError> {
        let tag = match map.get("type") {
            Some(Value::String(name)) => name.parse::<EventTag>()?,
            Some(other) => {
                return Err(PilotError::MalformedFrame(format!(
                    "\"type\" must be a string, got {other}"
                )));
            }
            None => return Err(PilotError::MalformedFrame("missing \"type\" field".to_string())),
        };
        let payload = map.remove(tag.as_str()).unwrap_or(Value::Null);
        Ok(Self { tag, payload })
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", &self.tag)?;
        map.serialize_entry(self.tag.as_str(), &self.payload)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Event::from_map(map).map_err(D::Error::custom)
    }
}

/// Global error type spanning wire parsing, service lifecycle, settings and
/// hardware failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PilotError {
    #[error("Unknown event tag: {0:?}")]
    UnknownTag(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("No command handler registered for tag: {0}")]
    NoHandler(EventTag),

    #[error("Failed to create service {service:?}: {reason}")]
    FailedToCreateService { service: String, reason: String },

    #[error("Invalid settings attribute: {0:?}")]
    InvalidAttribute(String),

    #[error("Failed to read settings: {0}")]
    SettingsRead(String),

    #[error("Hardware fault on {component}: {details}")]
    Hardware { component: String, details: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Update error: {0}")]
    Update(String),
}

impl PilotError {
    /// Shorthand for a [`PilotError::Hardware`] fault.
    pub fn hardware(component: impl Into<String>, details: impl fmt::Display) -> Self {
        PilotError::Hardware {
            component: component.into(),
            details: details.to_string(),
        }
    }
}

impl From<std::io::Error> for PilotError {
    fn from(e: std::io::Error) -> Self {
        PilotError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tag_names_roundtrip() {
        for tag in EventTag::ALL {
            assert_eq!(tag.as_str().parse::<EventTag>().unwrap(), tag);
            assert_eq!(serde_json::to_value(tag).unwrap(), json!(tag.as_str()));
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = "bogus".parse::<EventTag>().unwrap_err();
        assert_eq!(err, PilotError::UnknownTag("bogus".to_string()));
    }

    #[test]
    fn event_serialises_to_envelope() {
        let event = Event::new(EventTag::Settings, json!({"theme": "dark"}));
        let value: Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "settings", "settings": {"theme": "dark"}}));
        assert_eq!(event.to_value(), value);
    }

    #[test]
    fn from_frame_extracts_tag_payload() {
        let event = Event::from_frame(r#"{"type":"media","media":"next"}"#).unwrap();
        assert_eq!(event.tag, EventTag::Media);
        assert_eq!(event.payload, json!("next"));
    }

    #[test]
    fn from_frame_ignores_foreign_keys() {
        let event =
            Event::from_frame(r#"{"type":"media","media":"play","settings":{"x":1}}"#).unwrap();
        assert_eq!(event.payload, json!("play"));
    }

    #[test]
    fn missing_payload_is_null() {
        let event = Event::from_frame(r#"{"type":"updater"}"#).unwrap();
        assert_eq!(event.payload, Value::Null);
    }

    #[test]
    fn from_frame_rejects_bad_input() {
        assert!(matches!(
            Event::from_frame("not json"),
            Err(PilotError::MalformedFrame(_))
        ));
        assert!(matches!(
            Event::from_frame("[1,2]"),
            Err(PilotError::MalformedFrame(_))
        ));
        assert!(matches!(
            Event::from_frame(r#"{"media":"next"}"#),
            Err(PilotError::MalformedFrame(_))
        ));
        assert!(matches!(
            Event::from_frame(r#"{"type":7}"#),
            Err(PilotError::MalformedFrame(_))
        ));
        assert_eq!(
            Event::from_frame(r#"{"type":"bogus","bogus":{}}"#),
            Err(PilotError::UnknownTag("bogus".to_string()))
        );
    }

    #[test]
    fn event_deserialize_matches_from_frame() {
        let text = r#"{"type":"vehicle","vehicle":{"connected":false}}"#;
        let via_serde: Event = serde_json::from_str(text).unwrap();
        assert_eq!(via_serde, Event::from_frame(text).unwrap());
    }

    #[test]
    fn error_display() {
        let err = PilotError::FailedToCreateService {
            service: "camera".to_string(),
            reason: "no gpio".to_string(),
        };
        assert!(err.to_string().contains("camera"));
        assert!(PilotError::NoHandler(EventTag::Phone).to_string().contains("phone"));
        assert!(PilotError::hardware("obd", "timeout").to_string().contains("obd"));
    }
}
