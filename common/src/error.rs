use chrono::NaiveTime;
use thiserror::Error;

use crate::{schedule::DayOfWeek, types::EntityId};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid weekday set '{0}' (expected numbers 1-7, e.g. \"1-5,7\")")]
    InvalidWeekdays(String),
    #[error("schedule '{schedule}': item {start}-{end} must start before it ends")]
    EmptyInterval {
        schedule: String,
        start: NaiveTime,
        end: NaiveTime,
    },
    #[error("schedule '{schedule}': items overlap on {day}")]
    OverlappingItems { schedule: String, day: DayOfWeek },
    #[error("room '{room}' references unknown schedule '{schedule}'")]
    UnknownSchedule { room: String, schedule: String },
    #[error("room '{room}' uses mode '{mode}' which has no temperature")]
    UnknownMode { room: String, mode: String },
    #[error("invalid temperature limits: min {min} must be below max {max}")]
    InvalidLimits { min: f32, max: f32 },
    #[error("room '{room}' has no thermostat devices")]
    NoDevices { room: String },
    #[error("room '{room}': control point {entity_id} is also listed as a device")]
    ControlPointIsDevice { room: String, entity_id: EntityId },
}

#[derive(Debug, Error)]
pub enum HeatingError {
    #[error("room '{room}' references unknown entity {entity_id}")]
    EntityNotFound { room: String, entity_id: EntityId },
    #[error("unknown room '{0}'")]
    UnknownRoom(String),
}
