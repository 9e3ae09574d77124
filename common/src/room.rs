use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::{
    conditional::ConditionalResolver,
    config::RoomSetup,
    host::{Output, SharedHost, StateChange, Subscription, TimerHandle, TimerTarget},
    modes::ModeTable,
    schedule::{BoundaryKind, Schedule},
    thermostat::RoomThermostat,
    types::{EntityId, HeatingEvent, NextChange, RoomStatus, ScheduledState},
};

/// What a subscribed entity means to the room it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Condition,
    ControlPointState,
    ControlPointSetpoint,
    DeviceState,
    DeviceTemperature,
    Sensor,
}

/// Binds the schedule picked by the conditional rules to the room
/// thermostat and keeps one daily timer per item boundary of that schedule.
pub struct Room {
    name: String,
    host: SharedHost,
    thermostat: RoomThermostat,
    modes: ModeTable,
    default_mode: String,
    resolver: ConditionalResolver,
    active: Arc<Schedule>,
    timers: Vec<TimerHandle>,
    boundary_offset: Duration,
    next_change_entity: EntityId,
}

impl Room {
    pub fn new(setup: RoomSetup, host: SharedHost) -> Self {
        let RoomSetup {
            name,
            control_point,
            devices,
            sensors,
            modes,
            default_mode,
            resolver,
            limits,
            boundary_offset,
        } = setup;

        let thermostat = RoomThermostat::new(
            name.clone(),
            host.clone(),
            control_point,
            devices,
            sensors,
            limits,
        );
        let active = resolver.default_schedule().clone();
        let next_change_entity = EntityId::status_sensor(&name, "scheduled_change");

        Self {
            name,
            host,
            thermostat,
            modes,
            default_mode,
            resolver,
            active,
            timers: Vec::new(),
            boundary_offset,
            next_change_entity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn active_schedule(&self) -> &Arc<Schedule> {
        &self.active
    }

    pub fn thermostat(&self) -> &RoomThermostat {
        &self.thermostat
    }

    pub fn timers(&self) -> &[TimerHandle] {
        &self.timers
    }

    pub fn subscriptions(&self) -> Vec<(Subscription, Trigger)> {
        let mut subscriptions: Vec<_> = self
            .resolver
            .sources()
            .map(|entity_id| (Subscription::state(entity_id.clone()), Trigger::Condition))
            .collect();
        subscriptions.extend(self.thermostat.subscriptions());
        subscriptions
    }

    pub fn start(&mut self) {
        self.thermostat.refresh_sensors();
        self.thermostat.ensure_on();
        self.resolve(true);
    }

    pub fn stop(&mut self) {
        for handle in self.timers.drain(..) {
            self.host.cancel_timer(handle);
        }
    }

    /// Mode and temperature in effect at `at`; the default mode fills the
    /// gaps between items.
    pub fn current_state(&self, at: NaiveDateTime) -> Option<ScheduledState> {
        let mode = self
            .active
            .current_item_at(at)
            .map_or(self.default_mode.as_str(), |item| item.mode.as_str());
        let temperature = self.modes.temperature(mode)?;
        Some(ScheduledState {
            mode: mode.to_string(),
            temperature,
        })
    }

    /// The next boundary of the active schedule and what takes effect there.
    /// Leaving an item falls back to the default mode.
    pub fn next_state(&self, now: NaiveDateTime) -> Option<NextChange> {
        let (at, boundary) = self.active.next_change(now)?;
        let mode = match boundary.kind {
            BoundaryKind::Current => self.default_mode.as_str(),
            BoundaryKind::Next => boundary.item.mode.as_str(),
        };
        let temperature = self.modes.temperature(mode)?;
        Some(NextChange {
            at,
            mode: mode.to_string(),
            temperature,
            schedule: self.active.name().to_string(),
        })
    }

    /// Re-evaluates the conditional rules. When the schedule changes, or
    /// `force` is set, every boundary timer is replaced and the current
    /// target is written. Returns whether that happened.
    pub fn resolve(&mut self, force: bool) -> bool {
        let host = &self.host;
        let resolved = self
            .resolver
            .resolve(|entity_id| host.state(entity_id))
            .clone();

        let changed = resolved.name() != self.active.name();
        if changed {
            info!(
                room = %self.name,
                from = self.active.name(),
                to = resolved.name(),
                "switching schedule"
            );
            self.active = resolved;
            self.host.fire_event(HeatingEvent::ScheduleChanged {
                room: self.name.clone(),
                schedule: self.active.name().to_string(),
            });
        } else if !force {
            debug!(room = %self.name, schedule = self.active.name(), "schedule unchanged");
            return false;
        }

        self.install_timers();
        let now = self.host.now();
        self.apply_at(now, true);
        true
    }

    pub fn on_timer(&mut self, handle: TimerHandle, target: &TimerTarget) {
        if !self.timers.contains(&handle) {
            debug!(room = %self.name, at = %target.at, "ignoring timer of a replaced schedule");
            return;
        }

        info!(room = %self.name, at = %target.at, schedule = self.active.name(), "schedule boundary reached");
        let at = self.host.now() + self.boundary_offset;
        self.apply_at(at, true);
    }

    pub fn handle(&mut self, trigger: Trigger, change: &StateChange) {
        let new = change.new.as_deref();
        match trigger {
            Trigger::Condition => {
                self.resolve(false);
            }
            Trigger::ControlPointState => self.thermostat.on_state_changed(new),
            Trigger::ControlPointSetpoint => self.thermostat.on_setpoint_changed(new),
            Trigger::DeviceState => {
                self.thermostat
                    .on_device_state_changed(&change.entity_id, change.old.as_deref(), new)
            }
            Trigger::DeviceTemperature => self.thermostat.on_device_temperature_changed(),
            Trigger::Sensor => self.thermostat.on_sensor_changed(&change.entity_id, new),
        }
    }

    pub fn status(&self) -> RoomStatus {
        let now = self.host.now();
        RoomStatus {
            room: self.name.clone(),
            schedule: self.active.name().to_string(),
            mode: self.current_state(now).map(|state| state.mode),
            auto_target: self.thermostat.auto_target(),
            target: self.thermostat.target(),
            control: self.thermostat.control_state(),
            temperature: self.thermostat.room_temperature().value(),
            next_change: self.next_state(now),
        }
    }

    fn install_timers(&mut self) {
        for handle in self.timers.drain(..) {
            self.host.cancel_timer(handle);
        }

        for item in self.active.items() {
            for at in [item.start, item.end] {
                let target = TimerTarget {
                    room: self.name.clone(),
                    at,
                };
                self.timers
                    .push(self.host.run_daily(at, item.weekdays, target));
            }
        }
        debug!(room = %self.name, timers = self.timers.len(), "boundary timers installed");
    }

    fn apply_at(&mut self, at: NaiveDateTime, force: bool) {
        match self.current_state(at) {
            Some(state) => {
                info!(
                    room = %self.name,
                    schedule = self.active.name(),
                    mode = %state.mode,
                    temperature = state.temperature,
                    "applying schedule"
                );
                self.thermostat.apply_auto_target(state.temperature, force);
            }
            None => warn!(room = %self.name, "current mode has no temperature"),
        }
        self.publish_next_change(at);
    }

    fn publish_next_change(&self, now: NaiveDateTime) {
        let next = self.next_state(now);

        let mut attributes = Map::new();
        attributes.insert(
            "mode".to_string(),
            next.as_ref().map_or(Value::Null, |next| json!(next.mode)),
        );
        attributes.insert(
            "temperature".to_string(),
            next.as_ref().map_or(Value::Null, |next| json!(next.temperature)),
        );
        attributes.insert("schedule".to_string(), json!(self.active.name()));

        let state = next.as_ref().map_or_else(
            || "undefined".to_string(),
            |next| next.at.format("%Y-%m-%dT%H:%M:%S").to_string(),
        );
        self.host.set_output(Output {
            entity_id: self.next_change_entity.clone(),
            state,
            attributes,
        });
    }
}
