//! In-memory host and fixtures for unit tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::{
    config::HeatingConfig,
    host::{
        Attribute, HomeAutomation, Output, ServiceCall, Subscription, TimerHandle, TimerTarget,
    },
    schedule::{parse_time_of_day, Schedule, ScheduleItem, WeekdaySet},
    types::{EntityId, HeatingEvent},
};

/// January 2026; the 5th is a Monday.
pub fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 1, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

pub fn time(raw: &str) -> NaiveTime {
    parse_time_of_day(raw).unwrap()
}

pub fn work_schedule() -> Schedule {
    Schedule::new(
        "work",
        vec![
            ScheduleItem {
                start: time("06:00"),
                end: time("08:00"),
                mode: "comfort".to_string(),
                weekdays: "1-5".parse().unwrap(),
            },
            ScheduleItem {
                start: time("08:00"),
                end: time("17:00"),
                mode: "eco".to_string(),
                weekdays: "1-5".parse().unwrap(),
            },
        ],
    )
}

pub const CONFIG: &str = r#"{
    "modes": { "eco": 18.0, "comfort": 21.0 },
    "schedules": {
        "work": [
            { "start": "06:00", "end": "08:00", "mode": "comfort", "weekdays": "1-5" },
            { "start": "08:00", "end": "17:00", "mode": "eco", "weekdays": "1-5" }
        ],
        "home": [
            { "start": "07:00", "end": "22:00", "setmode": "comfort" }
        ]
    },
    "rooms": {
        "living": {
            "control_point": "climate.living",
            "thermostats": [ { "entity_id": "climate.living_radiator", "alpha": 0.5 } ],
            "sensors": [
                "sensor.living_temp_a",
                { "entity_id": "sensor.living_temp_b", "threshold": 0.5 }
            ],
            "default_schedule": "work",
            "modes": { "away": 15.0 },
            "conditional_schedules": [
                { "entity_id": "input_select.presence", "values": { "home_office": "home", "away": "home" } }
            ]
        }
    }
}"#;

pub fn config() -> HeatingConfig {
    serde_json::from_str(CONFIG).unwrap()
}

/// Entity states matching [`CONFIG`]: room at 19 degrees, nobody home.
pub fn seed(host: &FakeHost) {
    host.set_state("climate.living", "heat");
    host.set_attribute("climate.living", Attribute::Temperature, "18");
    host.set_state("climate.living_radiator", "heat");
    host.set_attribute("climate.living_radiator", Attribute::Temperature, "17");
    host.set_attribute("climate.living_radiator", Attribute::CurrentTemperature, "19");
    host.set_state("sensor.living_temp_a", "19.0");
    host.set_state("sensor.living_temp_b", "19.0");
    host.set_state("input_select.presence", "office");
}

#[derive(Debug, Clone, PartialEq)]
pub struct FakeTimer {
    pub handle: TimerHandle,
    pub at: NaiveTime,
    pub weekdays: WeekdaySet,
    pub target: TimerTarget,
}

#[derive(Default)]
struct FakeState {
    now: NaiveDateTime,
    states: HashMap<EntityId, String>,
    attributes: HashMap<(EntityId, Attribute), String>,
    calls: Vec<ServiceCall>,
    outputs: HashMap<EntityId, Output>,
    events: Vec<HeatingEvent>,
    timers: BTreeMap<TimerHandle, FakeTimer>,
    cancelled: usize,
    next_handle: u64,
    subscriptions: Vec<Subscription>,
    listened: Vec<&'static str>,
}

/// Records every interaction. Climate service calls are reflected back into
/// the entity attributes the way a real device would report them.
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new(now: NaiveDateTime) -> Arc<Self> {
        let host = Self::default();
        host.lock().now = now;
        Arc::new(host)
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_now(&self, now: NaiveDateTime) {
        self.lock().now = now;
    }

    pub fn set_state(&self, entity_id: &str, state: &str) {
        self.lock().states.insert(entity_id.into(), state.to_string());
    }

    pub fn remove_state(&self, entity_id: &str) {
        self.lock().states.remove(&EntityId::from(entity_id));
    }

    pub fn set_attribute(&self, entity_id: &str, attribute: Attribute, value: &str) {
        self.lock()
            .attributes
            .insert((entity_id.into(), attribute), value.to_string());
    }

    pub fn take_calls(&self) -> Vec<ServiceCall> {
        std::mem::take(&mut self.lock().calls)
    }

    pub fn output(&self, entity_id: &str) -> Option<Output> {
        self.lock().outputs.get(&EntityId::from(entity_id)).cloned()
    }

    pub fn events(&self) -> Vec<HeatingEvent> {
        self.lock().events.clone()
    }

    pub fn timers(&self) -> Vec<FakeTimer> {
        self.lock().timers.values().cloned().collect()
    }

    pub fn cancelled(&self) -> usize {
        self.lock().cancelled
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.lock().subscriptions.clone()
    }

    pub fn listened_events(&self) -> Vec<&'static str> {
        self.lock().listened.clone()
    }
}

impl HomeAutomation for FakeHost {
    fn state(&self, entity_id: &EntityId) -> Option<String> {
        self.lock().states.get(entity_id).cloned()
    }

    fn attribute(&self, entity_id: &EntityId, attribute: Attribute) -> Option<String> {
        self.lock()
            .attributes
            .get(&(entity_id.clone(), attribute))
            .cloned()
    }

    fn subscribe(&self, subscription: Subscription) {
        self.lock().subscriptions.push(subscription);
    }

    fn listen_event(&self, name: &'static str) {
        self.lock().listened.push(name);
    }

    fn fire_event(&self, event: HeatingEvent) {
        self.lock().events.push(event);
    }

    fn call_service(&self, call: ServiceCall) {
        let mut state = self.lock();
        match &call {
            ServiceCall::SetTemperature {
                entity_id,
                temperature,
            } => {
                state.attributes.insert(
                    (entity_id.clone(), Attribute::Temperature),
                    temperature.to_string(),
                );
            }
            ServiceCall::TurnOn { entity_id } => {
                state.states.insert(entity_id.clone(), "heat".to_string());
            }
        }
        state.calls.push(call);
    }

    fn set_output(&self, output: Output) {
        self.lock().outputs.insert(output.entity_id.clone(), output);
    }

    fn run_daily(&self, at: NaiveTime, weekdays: WeekdaySet, target: TimerTarget) -> TimerHandle {
        let mut state = self.lock();
        state.next_handle += 1;
        let handle = TimerHandle(state.next_handle);
        state.timers.insert(
            handle,
            FakeTimer {
                handle,
                at,
                weekdays,
                target,
            },
        );
        handle
    }

    fn cancel_timer(&self, handle: TimerHandle) {
        let mut state = self.lock();
        if state.timers.remove(&handle).is_some() {
            state.cancelled += 1;
        }
    }

    fn now(&self) -> NaiveDateTime {
        self.lock().now
    }
}
