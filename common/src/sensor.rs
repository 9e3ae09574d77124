use chrono::NaiveDateTime;
use tracing::warn;

use crate::types::EntityId;

/// Parses a raw entity state as a temperature. Anything that is not a finite
/// number (`unavailable`, `unknown`, garbage) counts as no reading.
pub fn parse_reading(raw: &str) -> Option<f32> {
    raw.trim()
        .parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureSensor {
    entity_id: EntityId,
    last_value: Option<f32>,
    last_value_time: Option<NaiveDateTime>,
    threshold: f32,
}

impl TemperatureSensor {
    pub fn new(entity_id: EntityId, threshold: f32) -> Self {
        Self {
            entity_id,
            last_value: None,
            last_value_time: None,
            threshold,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn value(&self) -> Option<f32> {
        self.last_value
    }

    pub fn last_value_time(&self) -> Option<NaiveDateTime> {
        self.last_value_time
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn is_valid(&self) -> bool {
        self.last_value.is_some()
    }

    /// Stores the new reading and reports whether it matters for fusion:
    /// validity flipped, or the value moved by more than the threshold.
    pub fn update(&mut self, raw: Option<&str>, now: NaiveDateTime) -> bool {
        let value = raw.and_then(parse_reading);
        let previous = self.last_value;

        self.last_value = value;
        if value.is_some() {
            self.last_value_time = Some(now);
        }

        match (previous, value) {
            (Some(previous), Some(value)) => (value - previous).abs() > self.threshold,
            (None, None) => false,
            _ => true,
        }
    }
}

/// Outcome of combining a room's sensor readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fusion {
    /// Every sensor is valid; their arithmetic mean.
    Mean(f32),
    /// Only some sensors are valid; one of their readings.
    Partial(f32),
    /// No valid sensor; the device's own measurement.
    Fallback(f32),
    Unavailable,
}

impl Fusion {
    pub fn value(self) -> Option<f32> {
        match self {
            Self::Mean(value) | Self::Partial(value) | Self::Fallback(value) => Some(value),
            Self::Unavailable => None,
        }
    }
}

pub fn fuse(room: &str, sensors: &[TemperatureSensor], fallback: Option<f32>) -> Fusion {
    let use_device = || fallback.map_or(Fusion::Unavailable, Fusion::Fallback);

    // Rooms without independent sensors are driven by the device reading.
    if sensors.is_empty() {
        return use_device();
    }

    let valid: Vec<f32> = sensors.iter().filter_map(TemperatureSensor::value).collect();
    match valid.first() {
        None => {
            warn!(room, "no valid temperature sensor, falling back to device reading");
            use_device()
        }
        Some(first) if valid.len() < sensors.len() => {
            warn!(
                room,
                valid = valid.len(),
                total = sensors.len(),
                "some temperature sensors are invalid, using a single reading"
            );
            Fusion::Partial(*first)
        }
        Some(_) => Fusion::Mean(valid.iter().sum::<f32>() / valid.len() as f32),
    }
}
