use serde_json::{json, Map};
use tracing::{info, warn};

use crate::{
    control::{same_setpoint, TemperatureLimits, ThermostatDevice},
    host::{Attribute, Output, ServiceCall, SharedHost, Subscription},
    room::Trigger,
    sensor::{fuse, parse_reading, Fusion, TemperatureSensor},
    types::{ControlState, EntityId},
};

/// Device states after which coming back counts as a power cycle.
const OFFLINE_STATES: [&str; 3] = ["off", "unavailable", "unknown"];

fn is_offline(state: Option<&str>) -> bool {
    state.map_or(true, |state| OFFLINE_STATES.contains(&state))
}

/// The user-facing control point of a room plus the devices and sensors
/// behind it.
///
/// The control point carries the room target. While its setpoint equals the
/// last target written by the schedule the room is in `auto`; any other
/// setpoint is an external override and switches it to `manual` until the
/// schedule writes again.
pub struct RoomThermostat {
    room: String,
    host: SharedHost,
    control_point: EntityId,
    devices: Vec<ThermostatDevice>,
    sensors: Vec<TemperatureSensor>,
    limits: TemperatureLimits,
    auto_target: Option<f32>,
    target: Option<f32>,
    manual: bool,
    status_entity: EntityId,
}

impl RoomThermostat {
    pub fn new(
        room: impl Into<String>,
        host: SharedHost,
        control_point: EntityId,
        devices: Vec<ThermostatDevice>,
        sensors: Vec<TemperatureSensor>,
        limits: TemperatureLimits,
    ) -> Self {
        let room = room.into();
        let status_entity = EntityId::status_sensor(&room, "heating_control");
        Self {
            room,
            host,
            control_point,
            devices,
            sensors,
            limits,
            auto_target: None,
            target: None,
            manual: false,
            status_entity,
        }
    }

    pub fn control_point(&self) -> &EntityId {
        &self.control_point
    }

    pub fn devices(&self) -> &[ThermostatDevice] {
        &self.devices
    }

    pub fn sensors(&self) -> &[TemperatureSensor] {
        &self.sensors
    }

    pub fn auto_target(&self) -> Option<f32> {
        self.auto_target
    }

    /// The setpoint currently in effect: the override while manual, the
    /// scheduled target otherwise.
    pub fn target(&self) -> Option<f32> {
        self.target
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    pub fn control_state(&self) -> ControlState {
        if self.manual {
            ControlState::Manual
        } else {
            ControlState::Auto
        }
    }

    pub fn status_entity(&self) -> &EntityId {
        &self.status_entity
    }

    pub fn subscriptions(&self) -> Vec<(Subscription, Trigger)> {
        let mut subscriptions = vec![
            (
                Subscription::state(self.control_point.clone()),
                Trigger::ControlPointState,
            ),
            (
                Subscription::attribute(self.control_point.clone(), Attribute::Temperature),
                Trigger::ControlPointSetpoint,
            ),
        ];
        for device in &self.devices {
            subscriptions.push((
                Subscription::state(device.entity_id().clone()),
                Trigger::DeviceState,
            ));
            subscriptions.push((
                Subscription::attribute(device.entity_id().clone(), Attribute::CurrentTemperature),
                Trigger::DeviceTemperature,
            ));
        }
        for sensor in &self.sensors {
            subscriptions.push((
                Subscription::state(sensor.entity_id().clone()),
                Trigger::Sensor,
            ));
        }
        subscriptions
    }

    /// Pulls the current readings of all sensors from the host.
    pub fn refresh_sensors(&mut self) {
        let now = self.host.now();
        for sensor in &mut self.sensors {
            let raw = self.host.state(sensor.entity_id());
            sensor.update(raw.as_deref(), now);
        }
    }

    pub fn room_temperature(&self) -> Fusion {
        let device_reading = self
            .devices
            .first()
            .and_then(|device| device.measured(&*self.host));
        fuse(&self.room, &self.sensors, device_reading)
    }

    /// Writes a target computed by the schedule. This always returns the room
    /// to automatic control.
    pub fn apply_auto_target(&mut self, target: f32, force: bool) {
        let reported = self
            .host
            .attribute(&self.control_point, Attribute::Temperature)
            .as_deref()
            .and_then(parse_reading);

        self.auto_target = Some(target);
        self.target = Some(target);

        if force || !reported.is_some_and(|reported| same_setpoint(reported, target)) {
            info!(room = %self.room, control_point = %self.control_point, target, "applying scheduled target");
            self.host.call_service(ServiceCall::SetTemperature {
                entity_id: self.control_point.clone(),
                temperature: target,
            });
        }

        self.set_manual(false);
        self.drive_devices(force);
    }

    pub fn on_setpoint_changed(&mut self, new: Option<&str>) {
        let Some(setpoint) = new.and_then(parse_reading) else {
            return;
        };

        self.target = Some(setpoint);
        let manual = self
            .auto_target
            .is_some_and(|auto| !same_setpoint(auto, setpoint));
        self.set_manual(manual);
        self.drive_devices(false);
    }

    /// A control point switched off is turned back on at the scheduled target.
    pub fn on_state_changed(&mut self, new: Option<&str>) {
        if new != Some("off") {
            return;
        }

        info!(room = %self.room, control_point = %self.control_point, "control point switched off, turning it back on");
        self.turn_on();
        if let Some(auto) = self.auto_target {
            self.apply_auto_target(auto, true);
        }
    }

    /// Turns the control point on if it currently reports "off". Returns
    /// whether a turn-on was issued.
    pub fn ensure_on(&self) -> bool {
        if self.host.state(&self.control_point).as_deref() != Some("off") {
            return false;
        }
        info!(room = %self.room, control_point = %self.control_point, "control point is off, turning it on");
        self.turn_on();
        true
    }

    fn turn_on(&self) {
        self.host.call_service(ServiceCall::TurnOn {
            entity_id: self.control_point.clone(),
        });
    }

    pub fn on_device_state_changed(&mut self, entity_id: &EntityId, old: Option<&str>, new: Option<&str>) {
        if !is_offline(old) || is_offline(new) {
            return;
        }

        info!(room = %self.room, device = %entity_id, "device came back, restoring scheduled target");
        if let Some(auto) = self.auto_target {
            self.apply_auto_target(auto, true);
        }
    }

    pub fn on_device_temperature_changed(&mut self) {
        self.drive_devices(false);
    }

    pub fn on_sensor_changed(&mut self, entity_id: &EntityId, new: Option<&str>) {
        let now = self.host.now();
        let Some(sensor) = self
            .sensors
            .iter_mut()
            .find(|sensor| sensor.entity_id() == entity_id)
        else {
            return;
        };

        if sensor.update(new, now) {
            self.drive_devices(false);
        }
    }

    fn set_manual(&mut self, manual: bool) {
        if self.manual != manual {
            let state = if manual { ControlState::Manual } else { ControlState::Auto };
            info!(
                room = %self.room,
                state = state.as_str(),
                target = ?self.target,
                auto_target = ?self.auto_target,
                "control mode changed"
            );
        }
        self.manual = manual;
        self.publish_status();
    }

    fn publish_status(&self) {
        let mut attributes = Map::new();
        attributes.insert("control_point".to_string(), json!(self.control_point));
        attributes.insert("auto_target".to_string(), json!(self.auto_target));
        attributes.insert("target".to_string(), json!(self.target));

        self.host.set_output(Output {
            entity_id: self.status_entity.clone(),
            state: self.control_state().as_str().to_string(),
            attributes,
        });
    }

    fn drive_devices(&self, force: bool) {
        let Some(target) = self.target else {
            return;
        };
        let Some(measured) = self.room_temperature().value() else {
            warn!(room = %self.room, "no room temperature available, leaving devices untouched");
            return;
        };

        for device in &self.devices {
            device.drive(&*self.host, target, measured, self.limits, force);
        }
    }
}
