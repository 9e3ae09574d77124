//! The narrow interface the heating engine needs from the automation host.
//!
//! Everything the engine reads or writes goes through [`HomeAutomation`]; the
//! host in turn feeds change notifications, timer fires and bus events back
//! into [`crate::HeatingEngine`]. Calls are fire-and-forget: delivery failures
//! are the host's business.

use std::sync::Arc;

use chrono::{NaiveDateTime, NaiveTime};
use serde_json::{json, Map, Value};

use crate::{
    schedule::WeekdaySet,
    types::{EntityId, HeatingEvent},
};

/// Entity attributes the engine listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attribute {
    /// Setpoint of a climate entity.
    Temperature,
    /// A climate entity's own measured temperature.
    CurrentTemperature,
}

impl Attribute {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::CurrentTemperature => "current_temperature",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "temperature" => Some(Self::Temperature),
            "current_temperature" => Some(Self::CurrentTemperature),
            _ => None,
        }
    }
}

/// A change-notification request: an entity's state (`attribute: None`) or
/// one of its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subscription {
    pub entity_id: EntityId,
    pub attribute: Option<Attribute>,
}

impl Subscription {
    pub fn state(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            attribute: None,
        }
    }

    pub fn attribute(entity_id: EntityId, attribute: Attribute) -> Self {
        Self {
            entity_id,
            attribute: Some(attribute),
        }
    }
}

/// Payload delivered for a [`Subscription`]. Values are the raw strings the
/// host reports; `None` means the entity or attribute is absent.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub entity_id: EntityId,
    pub attribute: Option<Attribute>,
    pub old: Option<String>,
    pub new: Option<String>,
}

impl StateChange {
    pub fn subscription(&self) -> Subscription {
        Subscription {
            entity_id: self.entity_id.clone(),
            attribute: self.attribute,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCall {
    SetTemperature {
        entity_id: EntityId,
        temperature: f32,
    },
    TurnOn {
        entity_id: EntityId,
    },
}

impl ServiceCall {
    pub fn domain(&self) -> &'static str {
        "climate"
    }

    pub fn service(&self) -> &'static str {
        match self {
            Self::SetTemperature { .. } => "set_temperature",
            Self::TurnOn { .. } => "turn_on",
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        match self {
            Self::SetTemperature { entity_id, .. } | Self::TurnOn { entity_id } => entity_id,
        }
    }

    /// Keyword arguments of the call.
    pub fn data(&self) -> Value {
        match self {
            Self::SetTemperature {
                entity_id,
                temperature,
            } => json!({ "entity_id": entity_id, "temperature": temperature }),
            Self::TurnOn { entity_id } => json!({ "entity_id": entity_id }),
        }
    }
}

/// Value written to an observable status entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub entity_id: EntityId,
    pub state: String,
    pub attributes: Map<String, Value>,
}

/// Identifies what a daily timer is for when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerTarget {
    pub room: String,
    pub at: NaiveTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

pub trait HomeAutomation: Send + Sync {
    /// Current state of an entity, `None` when the host does not know it.
    fn state(&self, entity_id: &EntityId) -> Option<String>;

    fn attribute(&self, entity_id: &EntityId, attribute: Attribute) -> Option<String>;

    /// Ask the host to deliver [`StateChange`]s for `subscription`.
    fn subscribe(&self, subscription: Subscription);

    /// Ask the host to deliver bus events with the given name.
    fn listen_event(&self, name: &'static str);

    fn fire_event(&self, event: HeatingEvent);

    fn call_service(&self, call: ServiceCall);

    fn set_output(&self, output: Output);

    /// Fire `target` every day at `at`, restricted to `weekdays`.
    fn run_daily(&self, at: NaiveTime, weekdays: WeekdaySet, target: TimerTarget) -> TimerHandle;

    fn cancel_timer(&self, handle: TimerHandle);

    /// Local wall-clock time.
    fn now(&self) -> NaiveDateTime;
}

pub type SharedHost = Arc<dyn HomeAutomation>;
