use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `climate` for `climate.living_room`.
    pub fn domain(&self) -> &str {
        self.0.split_once('.').map_or("", |(domain, _)| domain)
    }

    /// `sensor.<slug>_<suffix>`, where the slug is `name` lowercased with
    /// anything but ASCII alphanumerics replaced by `_`.
    pub fn status_sensor(name: &str, suffix: &str) -> Self {
        let slug: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        Self(format!("sensor.{slug}_{suffix}"))
    }

    /// `living_room` for `climate.living_room`.
    pub fn object_id(&self) -> &str {
        self.0.split_once('.').map_or(self.0.as_str(), |(_, object)| object)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlState {
    Auto,
    Manual,
}

impl ControlState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledState {
    pub mode: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextChange {
    pub at: NaiveDateTime,
    pub mode: String,
    pub temperature: f32,
    pub schedule: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomStatus {
    pub room: String,
    pub schedule: String,
    pub mode: Option<String>,
    #[serde(rename = "autoTarget")]
    pub auto_target: Option<f32>,
    pub target: Option<f32>,
    pub control: ControlState,
    pub temperature: Option<f32>,
    #[serde(rename = "nextChange")]
    pub next_change: Option<NextChange>,
}

/// Events exchanged over the host's internal event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeatingEvent {
    ScheduleChanged {
        room: String,
        schedule: String,
    },
    Reapply {
        #[serde(default)]
        room: Option<String>,
    },
}

impl HeatingEvent {
    pub const SCHEDULE_CHANGED: &'static str = "schedule_changed";
    pub const REAPPLY: &'static str = "reapply";

    pub fn name(&self) -> &'static str {
        match self {
            Self::ScheduleChanged { .. } => Self::SCHEDULE_CHANGED,
            Self::Reapply { .. } => Self::REAPPLY,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn splits_entity_id() {
        let id = EntityId::from("climate.living_room");
        assert_eq!(id.domain(), "climate");
        assert_eq!(id.object_id(), "living_room");

        let bare = EntityId::from("weird");
        assert_eq!(bare.domain(), "");
        assert_eq!(bare.object_id(), "weird");
    }

    #[test]
    fn builds_status_sensor_ids() {
        assert_eq!(
            EntityId::status_sensor("Living Room", "heating_control").as_str(),
            "sensor.living_room_heating_control"
        );
    }

    #[test]
    fn reapply_event_round_trips_without_room() {
        let event: HeatingEvent = serde_json::from_str(r#"{"event":"reapply"}"#).unwrap();
        assert_eq!(event, HeatingEvent::Reapply { room: None });
        assert_eq!(event.name(), "reapply");
    }
}
