use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    host::{Attribute, HomeAutomation, ServiceCall},
    sensor::parse_reading,
    types::EntityId,
};

/// Setpoints closer than this are considered equal.
const SETPOINT_TOLERANCE: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureLimits {
    pub min_temp: f32,
    pub max_temp: f32,
}

impl Default for TemperatureLimits {
    fn default() -> Self {
        Self {
            min_temp: 17.0,
            max_temp: 28.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTuning {
    pub alpha: f32,
    pub offset: f32,
}

impl Default for DeviceTuning {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            offset: 0.0,
        }
    }
}

pub fn same_setpoint(a: f32, b: f32) -> bool {
    (a - b).abs() < SETPOINT_TOLERANCE
}

pub fn round_to_half_degree(value: f32) -> f32 {
    (value * 2.0).round() / 2.0
}

/// Proportional control law. While the room is below `target` the device is
/// asked for its own reading plus `alpha * delta + offset`, never less than
/// `target` and never more than the ceiling. Otherwise it is parked at the
/// floor.
pub fn compute_setpoint(
    target: f32,
    measured: f32,
    device_measured: f32,
    tuning: DeviceTuning,
    limits: TemperatureLimits,
) -> f32 {
    let delta = target - measured;
    if delta <= 0.0 {
        return limits.min_temp;
    }

    let raw = device_measured + tuning.alpha * delta + tuning.offset;
    round_to_half_degree(raw)
        .max(target)
        .min(limits.max_temp)
        .max(limits.min_temp)
}

/// A physical thermostat driven by the control law.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermostatDevice {
    entity_id: EntityId,
    tuning: DeviceTuning,
}

impl ThermostatDevice {
    pub fn new(entity_id: EntityId, tuning: DeviceTuning) -> Self {
        Self { entity_id, tuning }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn tuning(&self) -> DeviceTuning {
        self.tuning
    }

    pub fn measured(&self, host: &dyn HomeAutomation) -> Option<f32> {
        host.attribute(&self.entity_id, Attribute::CurrentTemperature)
            .as_deref()
            .and_then(parse_reading)
    }

    pub fn setpoint(&self, host: &dyn HomeAutomation) -> Option<f32> {
        host.attribute(&self.entity_id, Attribute::Temperature)
            .as_deref()
            .and_then(parse_reading)
    }

    /// Computes the device setpoint and writes it when it differs from what
    /// the device reports, or always when `force` is set. Returns the written
    /// setpoint.
    pub fn drive(
        &self,
        host: &dyn HomeAutomation,
        target: f32,
        measured: f32,
        limits: TemperatureLimits,
        force: bool,
    ) -> Option<f32> {
        // Without its own reading the device is assumed to see the room value.
        let device_measured = self.measured(host).unwrap_or(measured);
        let setpoint = compute_setpoint(target, measured, device_measured, self.tuning, limits);

        let current = self.setpoint(host);
        if !force && current.is_some_and(|current| same_setpoint(current, setpoint)) {
            debug!(device = %self.entity_id, setpoint, "device setpoint unchanged");
            return None;
        }

        info!(
            device = %self.entity_id,
            target,
            measured,
            device_measured,
            setpoint,
            force,
            "writing device setpoint"
        );
        host.call_service(ServiceCall::SetTemperature {
            entity_id: self.entity_id.clone(),
            temperature: setpoint,
        });
        Some(setpoint)
    }
}
