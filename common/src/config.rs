use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{
    conditional::{ConditionalResolver, ConditionalRule},
    control::{DeviceTuning, TemperatureLimits, ThermostatDevice},
    error::ConfigError,
    modes::ModeTable,
    schedule::{Schedule, ScheduleItem},
    sensor::TemperatureSensor,
    types::EntityId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatingConfig {
    /// Mode used while no schedule item is active.
    pub default_mode: String,
    pub limits: TemperatureLimits,
    /// Hysteresis for sensors configured without their own threshold.
    pub sensor_threshold: f32,
    pub boundary_offset_secs: u32,
    pub modes: ModeTable,
    pub schedules: BTreeMap<String, Vec<ScheduleItem>>,
    pub rooms: BTreeMap<String, RoomConfig>,
}

impl Default for HeatingConfig {
    fn default() -> Self {
        Self {
            default_mode: "eco".to_string(),
            limits: TemperatureLimits::default(),
            sensor_threshold: 0.2,
            boundary_offset_secs: 10,
            modes: [("eco", 18.0), ("comfort", 21.0)].into_iter().collect(),
            schedules: BTreeMap::new(),
            rooms: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub entity_id: EntityId,
    #[serde(flatten)]
    pub tuning: DeviceTuning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorConfig {
    Id(EntityId),
    Detailed {
        entity_id: EntityId,
        #[serde(default)]
        threshold: Option<f32>,
    },
}

impl SensorConfig {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            Self::Id(entity_id) | Self::Detailed { entity_id, .. } => entity_id,
        }
    }

    pub fn threshold(&self) -> Option<f32> {
        match self {
            Self::Id(_) => None,
            Self::Detailed { threshold, .. } => *threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalConfig {
    pub entity_id: EntityId,
    /// Entity state to schedule name.
    pub values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub control_point: EntityId,
    #[serde(default)]
    pub thermostats: Vec<DeviceConfig>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    pub default_schedule: String,
    #[serde(default)]
    pub modes: ModeTable,
    #[serde(default, alias = "conditionals")]
    pub conditional_schedules: Vec<ConditionalConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub client_id: String,
    /// Root of the mirrored entity states.
    pub state_prefix: String,
    /// Root for service calls, outputs and events.
    pub command_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            client_id: "heating-controller".to_string(),
            state_prefix: "homeassistant".to_string(),
            command_prefix: "heating".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub heating: HeatingConfig,
    pub timezone: String,
    pub network: NetworkConfig,
    pub http_port: u16,
    pub startup_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heating: HeatingConfig::default(),
            timezone: "Europe/Berlin".to_string(),
            network: NetworkConfig::default(),
            http_port: 8080,
            startup_timeout_secs: 10,
        }
    }
}

/// Everything needed to build one room, with all names resolved.
#[derive(Debug, Clone)]
pub struct RoomSetup {
    pub name: String,
    pub control_point: EntityId,
    pub devices: Vec<ThermostatDevice>,
    pub sensors: Vec<TemperatureSensor>,
    pub modes: ModeTable,
    pub default_mode: String,
    pub resolver: ConditionalResolver,
    pub limits: TemperatureLimits,
    pub boundary_offset: Duration,
}

impl RoomSetup {
    /// Every external entity the room reads from or writes to.
    pub fn referenced_entities(&self) -> Vec<&EntityId> {
        std::iter::once(&self.control_point)
            .chain(self.devices.iter().map(ThermostatDevice::entity_id))
            .chain(self.sensors.iter().map(TemperatureSensor::entity_id))
            .chain(self.resolver.sources())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct HeatingSetup {
    pub schedules: BTreeMap<String, Arc<Schedule>>,
    pub rooms: Vec<RoomSetup>,
}

impl HeatingSetup {
    pub fn assemble(config: &HeatingConfig) -> Result<Self, ConfigError> {
        let limits = config.limits;
        if limits.min_temp >= limits.max_temp {
            return Err(ConfigError::InvalidLimits {
                min: limits.min_temp,
                max: limits.max_temp,
            });
        }

        let schedules = config
            .schedules
            .iter()
            .map(|(name, items)| {
                Schedule::validated(name.clone(), items.clone())
                    .map(|schedule| (name.clone(), Arc::new(schedule)))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let rooms = config
            .rooms
            .iter()
            .map(|(name, room)| assemble_room(config, &schedules, name, room))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { schedules, rooms })
    }
}

fn assemble_room(
    config: &HeatingConfig,
    schedules: &BTreeMap<String, Arc<Schedule>>,
    name: &str,
    room: &RoomConfig,
) -> Result<RoomSetup, ConfigError> {
    if room.thermostats.is_empty() {
        return Err(ConfigError::NoDevices {
            room: name.to_string(),
        });
    }
    if let Some(device) = room
        .thermostats
        .iter()
        .find(|device| device.entity_id == room.control_point)
    {
        return Err(ConfigError::ControlPointIsDevice {
            room: name.to_string(),
            entity_id: device.entity_id.clone(),
        });
    }

    let lookup = |schedule: &str| {
        schedules
            .get(schedule)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownSchedule {
                room: name.to_string(),
                schedule: schedule.to_string(),
            })
    };

    let default = lookup(&room.default_schedule)?;
    let rules = room
        .conditional_schedules
        .iter()
        .map(|rule| {
            let values = rule
                .values
                .iter()
                .map(|(state, schedule)| Ok((state.clone(), lookup(schedule)?)))
                .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;
            Ok(ConditionalRule::new(rule.entity_id.clone(), values))
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;
    let resolver = ConditionalResolver::new(default, rules);

    let modes = ModeTable::merged(&config.modes, &room.modes);
    let used_modes: BTreeSet<&str> = resolver
        .schedules()
        .flat_map(|schedule| schedule.items().iter().map(|item| item.mode.as_str()))
        .chain(std::iter::once(config.default_mode.as_str()))
        .collect();
    if let Some(mode) = used_modes.into_iter().find(|mode| !modes.contains(mode)) {
        return Err(ConfigError::UnknownMode {
            room: name.to_string(),
            mode: mode.to_string(),
        });
    }

    let devices = room
        .thermostats
        .iter()
        .map(|device| ThermostatDevice::new(device.entity_id.clone(), device.tuning))
        .collect();
    let sensors = room
        .sensors
        .iter()
        .map(|sensor| {
            TemperatureSensor::new(
                sensor.entity_id().clone(),
                sensor.threshold().unwrap_or(config.sensor_threshold),
            )
        })
        .collect();

    Ok(RoomSetup {
        name: name.to_string(),
        control_point: room.control_point.clone(),
        devices,
        sensors,
        modes,
        default_mode: config.default_mode.clone(),
        resolver,
        limits: config.limits,
        boundary_offset: Duration::seconds(i64::from(config.boundary_offset_secs)),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::config;

    #[test]
    fn assembles_rooms_with_resolved_names() {
        let setup = HeatingSetup::assemble(&config()).unwrap();
        assert_eq!(setup.schedules.keys().collect::<Vec<_>>(), vec!["home", "work"]);

        let room = &setup.rooms[0];
        assert_eq!(room.name, "living");
        assert_eq!(room.resolver.default_schedule().name(), "work");
        assert!(Arc::ptr_eq(
            room.resolver.default_schedule(),
            &setup.schedules["work"]
        ));
        assert_eq!(room.modes.temperature("comfort"), Some(21.0));
        assert_eq!(room.modes.temperature("away"), Some(15.0));
        assert_eq!(room.devices[0].tuning().alpha, 0.5);
        assert_eq!(room.devices[0].tuning().offset, 0.0);
        assert_eq!(room.sensors[0].threshold(), 0.2);
        assert_eq!(room.sensors[1].threshold(), 0.5);
        assert_eq!(room.boundary_offset, Duration::seconds(10));
        assert_eq!(
            room.referenced_entities()
                .into_iter()
                .map(EntityId::as_str)
                .collect::<Vec<_>>(),
            vec![
                "climate.living",
                "climate.living_radiator",
                "sensor.living_temp_a",
                "sensor.living_temp_b",
                "input_select.presence",
            ]
        );
    }

    #[test]
    fn reads_yaml_with_aliases() {
        let raw = r#"
limits:
  min_temp: 16
  max_temp: 26
schedules:
  weekend:
    - { start: "09:00", end: "23:00", setmode: comfort, weekdays: [6, 7] }
rooms:
  bath:
    control_point: climate.bath
    thermostats:
      - entity_id: climate.bath_radiator
    default_schedule: weekend
    conditionals:
      - entity_id: binary_sensor.bath_window
        values: { "on": weekend }
"#;
        let config: HeatingConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.default_mode, "eco");
        assert_eq!(config.limits.max_temp, 26.0);

        let setup = HeatingSetup::assemble(&config).unwrap();
        let bath = &setup.rooms[0];
        assert_eq!(bath.devices[0].tuning(), DeviceTuning::default());
        assert_eq!(bath.resolver.rules().len(), 1);
        assert_eq!(bath.limits.min_temp, 16.0);
    }

    #[test]
    fn rejects_unknown_schedule() {
        let mut config = config();
        config.rooms.get_mut("living").unwrap().default_schedule = "night".to_string();
        assert_eq!(
            HeatingSetup::assemble(&config).unwrap_err(),
            ConfigError::UnknownSchedule {
                room: "living".to_string(),
                schedule: "night".to_string(),
            }
        );
    }

    #[test]
    fn rejects_modes_without_temperature() {
        let mut config = config();
        config.default_mode = "frost".to_string();
        assert_eq!(
            HeatingSetup::assemble(&config).unwrap_err(),
            ConfigError::UnknownMode {
                room: "living".to_string(),
                mode: "frost".to_string(),
            }
        );
    }

    #[test]
    fn rejects_inverted_limits() {
        let mut config = config();
        config.limits = TemperatureLimits {
            min_temp: 25.0,
            max_temp: 20.0,
        };
        assert!(matches!(
            HeatingSetup::assemble(&config),
            Err(ConfigError::InvalidLimits { .. })
        ));
    }

    #[test]
    fn rejects_rooms_without_devices() {
        let mut config = config();
        let room = config.rooms.get_mut("living").unwrap();
        room.thermostats.clear();
        assert_eq!(
            HeatingSetup::assemble(&config).unwrap_err(),
            ConfigError::NoDevices {
                room: "living".to_string()
            }
        );

        let room = config.rooms.get_mut("living").unwrap();
        room.thermostats.push(DeviceConfig {
            entity_id: room.control_point.clone(),
            tuning: DeviceTuning::default(),
        });
        assert!(matches!(
            HeatingSetup::assemble(&config),
            Err(ConfigError::ControlPointIsDevice { .. })
        ));
    }

    #[test]
    fn runtime_defaults_fill_missing_sections() {
        let runtime: RuntimeConfig = serde_json::from_str(r#"{"http_port": 9000}"#).unwrap();
        assert_eq!(runtime.http_port, 9000);
        assert_eq!(runtime.timezone, "Europe/Berlin");
        assert_eq!(runtime.network.mqtt_port, 1883);
        assert_eq!(runtime.heating.modes.temperature("eco"), Some(18.0));
    }
}
