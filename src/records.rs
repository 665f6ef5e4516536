//! Records exchanged with clients and pushed as server events

use chrono::{DateTime, Local};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Absolute pan, tilt and zoom as requested by a client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtzRecord {
    pub pan: i64,
    pub tilt: i64,
    pub zoom: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusRecord {
    pub auto: bool,
    /// Absent leaves the absolute focus where it is
    #[serde(default)]
    pub value: Option<i64>,
}

/// Compass heading sent by the drive pad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Heading {
    #[serde(rename = "N")]
    North,
    #[serde(rename = "S")]
    South,
    #[serde(rename = "E")]
    East,
    #[serde(rename = "W")]
    West,
    #[serde(rename = "NE")]
    NorthEast,
    #[serde(rename = "NW")]
    NorthWest,
    #[serde(rename = "SE")]
    SouthEast,
    #[serde(rename = "SW")]
    SouthWest,
    #[serde(rename = "C")]
    Center,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionRecord {
    pub direction: Heading,
    #[serde(default)]
    pub x: Option<i64>,
    #[serde(default)]
    pub y: Option<i64>,
}

/// What changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Ptz(PtzRecord),
    Focus(FocusRecord),
    Direction(DirectionRecord),
    Message(String),
}

impl EventPayload {
    /// Discriminator carried next to the payload on the wire.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::Ptz(_) => "PTZRecord",
            EventPayload::Focus(_) => "Focus",
            EventPayload::Direction(_) => "Direction",
            EventPayload::Message(_) => "str",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub timestamp: DateTime<Local>,
    pub payload: EventPayload,
}

impl Serialize for EventData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("EventData", 3)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("event_type", self.payload.event_type())?;
        state.serialize_field("payload", &self.payload)?;
        state.end()
    }
}

/// One state-change notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerEvent {
    pub event: &'static str,
    pub id: Uuid,
    pub data: EventData,
}

impl ServerEvent {
    pub const STATE_CHANGED: &'static str = "state_changed";

    pub fn new(payload: EventPayload) -> Self {
        Self {
            event: Self::STATE_CHANGED,
            id: Uuid::new_v4(),
            data: EventData {
                timestamp: Local::now(),
                payload,
            },
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.data.payload.event_type()
    }
}

impl From<PtzRecord> for EventPayload {
    fn from(record: PtzRecord) -> Self {
        EventPayload::Ptz(record)
    }
}

impl From<FocusRecord> for EventPayload {
    fn from(record: FocusRecord) -> Self {
        EventPayload::Focus(record)
    }
}

impl From<DirectionRecord> for EventPayload {
    fn from(record: DirectionRecord) -> Self {
        EventPayload::Direction(record)
    }
}
