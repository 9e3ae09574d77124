pub mod conditional;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod host;
pub mod modes;
pub mod room;
pub mod schedule;
pub mod sensor;
pub mod thermostat;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{HeatingConfig, HeatingSetup, NetworkConfig, RuntimeConfig};
pub use engine::HeatingEngine;
pub use error::{ConfigError, HeatingError};
pub use host::{
    Attribute, HomeAutomation, Output, ServiceCall, SharedHost, StateChange, Subscription,
    TimerHandle, TimerTarget,
};
pub use schedule::{DayOfWeek, Schedule, ScheduleItem, WeekdaySet};
pub use types::{ControlState, EntityId, HeatingEvent, NextChange, RoomStatus};
