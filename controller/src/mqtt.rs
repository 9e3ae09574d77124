//! [`HomeAutomation`] on top of an MQTT broker.
//!
//! Entity states are mirrored from a Home Assistant `mqtt_statestream`
//! export: `<state_prefix>/<domain>/<object>/state` carries the state and
//! `<state_prefix>/<domain>/<object>/<attribute>` each attribute as JSON.
//! Everything the engine emits goes below `<command_prefix>`.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        PoisonError, RwLock,
    },
};

use anyhow::Context;
use chrono::{NaiveDateTime, NaiveTime};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, QoS};
use serde_json::{json, Value};
use tokio::{sync::mpsc::UnboundedSender, task::AbortHandle};
use tracing::{debug, warn};

use heating_common::{
    Attribute, EntityId, HeatingEvent, HomeAutomation, Output, ServiceCall, StateChange,
    Subscription, TimerHandle, TimerTarget, WeekdaySet,
};

use crate::timers;

pub const MAX_MQTT_PAYLOAD_BYTES: usize = 1024;

/// Work for the single dispatch task that owns the engine.
#[derive(Debug)]
pub enum HostMessage {
    StateChanged(StateChange),
    Timer(TimerHandle, TimerTarget),
    Event(HeatingEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    State(EntityId),
    Attribute(EntityId, String),
    Event(String),
}

#[derive(Debug, Clone)]
pub struct Topics {
    state_prefix: String,
    command_prefix: String,
}

impl Topics {
    pub fn new(state_prefix: &str, command_prefix: &str) -> Self {
        Self {
            state_prefix: state_prefix.trim_end_matches('/').to_string(),
            command_prefix: command_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn entity_filter(&self, entity_id: &EntityId) -> String {
        format!(
            "{}/{}/{}/#",
            self.state_prefix,
            entity_id.domain(),
            entity_id.object_id()
        )
    }

    pub fn event_filter(&self) -> String {
        format!("{}/event/+", self.command_prefix)
    }

    pub fn event(&self, name: &str) -> String {
        format!("{}/event/{name}", self.command_prefix)
    }

    pub fn service(&self, call: &ServiceCall) -> String {
        format!(
            "{}/service/{}/{}",
            self.command_prefix,
            call.domain(),
            call.service()
        )
    }

    pub fn output(&self, entity_id: &EntityId) -> String {
        format!("{}/output/{entity_id}", self.command_prefix)
    }

    pub fn parse(&self, topic: &str) -> Option<TopicKind> {
        if let Some(rest) = strip_root(topic, &self.command_prefix) {
            let name = rest.strip_prefix("event/")?;
            return (!name.is_empty() && !name.contains('/')).then(|| TopicKind::Event(name.to_string()));
        }

        let rest = strip_root(topic, &self.state_prefix)?;
        let mut parts = rest.split('/');
        let (domain, object, leaf) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || domain.is_empty() || object.is_empty() {
            return None;
        }

        let entity_id = EntityId::new(format!("{domain}.{object}"));
        Some(match leaf {
            "state" => TopicKind::State(entity_id),
            attribute => TopicKind::Attribute(entity_id, attribute.to_string()),
        })
    }
}

fn strip_root<'a>(topic: &'a str, root: &str) -> Option<&'a str> {
    topic.strip_prefix(root)?.strip_prefix('/')
}

/// Attribute payloads are JSON; strings are unwrapped, everything else is
/// kept in its JSON text form.
pub fn decode_attribute(payload: &str) -> String {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::String(value)) => value,
        Ok(value) => value.to_string(),
        Err(_) => payload.to_string(),
    }
}

#[derive(Debug, Default, Clone)]
struct EntityState {
    state: Option<String>,
    attributes: HashMap<String, String>,
}

/// Last known state and attributes of every mirrored entity.
#[derive(Debug, Default)]
pub struct EntityStore {
    entities: RwLock<HashMap<EntityId, EntityState>>,
}

impl EntityStore {
    pub fn state(&self, entity_id: &EntityId) -> Option<String> {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        entities.get(entity_id)?.state.clone()
    }

    pub fn attribute(&self, entity_id: &EntityId, name: &str) -> Option<String> {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        entities.get(entity_id)?.attributes.get(name).cloned()
    }

    /// Stores a value (or clears it on `None`) and returns the previous one.
    pub fn update(&self, entity_id: &EntityId, attribute: Option<&str>, value: Option<String>) -> Option<String> {
        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        let entity = entities.entry(entity_id.clone()).or_default();
        match (attribute, value) {
            (None, value) => std::mem::replace(&mut entity.state, value),
            (Some(name), Some(value)) => entity.attributes.insert(name.to_string(), value),
            (Some(name), None) => entity.attributes.remove(name),
        }
    }

    pub fn missing<'a>(&self, entity_ids: impl IntoIterator<Item = &'a EntityId>) -> Vec<EntityId> {
        entity_ids
            .into_iter()
            .filter(|entity_id| self.state(entity_id).is_none())
            .cloned()
            .collect()
    }
}

pub struct MqttHost {
    mqtt: AsyncClient,
    topics: Topics,
    timezone: Tz,
    store: EntityStore,
    dispatch: UnboundedSender<HostMessage>,
    filters: Vec<String>,
    subscriptions: RwLock<HashSet<Subscription>>,
    events: RwLock<HashSet<String>>,
    timers: RwLock<HashMap<TimerHandle, AbortHandle>>,
    next_timer: AtomicU64,
}

impl MqttHost {
    /// `entities` are mirrored from the broker; nothing else is stored.
    pub fn new(
        mqtt: AsyncClient,
        topics: Topics,
        timezone: Tz,
        entities: &[EntityId],
        dispatch: UnboundedSender<HostMessage>,
    ) -> Self {
        let mut filters: Vec<String> = entities
            .iter()
            .map(|entity_id| topics.entity_filter(entity_id))
            .collect();
        filters.sort();
        filters.dedup();
        filters.push(topics.event_filter());

        Self {
            mqtt,
            topics,
            timezone,
            store: EntityStore::default(),
            dispatch,
            filters,
            subscriptions: RwLock::default(),
            events: RwLock::default(),
            timers: RwLock::default(),
            next_timer: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// (Re)subscribes to every mirrored entity and the event bus. Called on
    /// each broker connect since sessions are not persistent.
    pub fn subscribe_all(&self) {
        for filter in &self.filters {
            if let Err(err) = self.mqtt.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                warn!("mqtt subscribe to {filter} failed: {err}");
            }
        }
    }

    pub fn handle_publish(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
        if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
            warn!(
                "dropping oversized MQTT payload on topic {} ({} bytes)",
                topic,
                payload.len()
            );
            return Ok(());
        }

        let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;
        match self.topics.parse(topic) {
            Some(TopicKind::State(entity_id)) => {
                let state = Some(message.trim().to_string()).filter(|state| !state.is_empty());
                self.record(entity_id, None, state);
            }
            Some(TopicKind::Attribute(entity_id, name)) => {
                let value = Some(decode_attribute(message)).filter(|_| !message.is_empty());
                self.record(entity_id, Some(name), value);
            }
            Some(TopicKind::Event(name)) => self.receive_event(&name, message)?,
            None => debug!(topic, "ignoring mqtt message"),
        }
        Ok(())
    }

    fn record(&self, entity_id: EntityId, attribute: Option<String>, new: Option<String>) {
        let old = self.store.update(&entity_id, attribute.as_deref(), new.clone());

        let attribute = match attribute.as_deref().map(Attribute::from_name) {
            None => None,
            Some(Some(attribute)) => Some(attribute),
            Some(None) => return,
        };
        let subscription = Subscription {
            entity_id,
            attribute,
        };
        let subscribed = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&subscription);
        if subscribed && old != new {
            self.send(HostMessage::StateChanged(StateChange {
                entity_id: subscription.entity_id,
                attribute: subscription.attribute,
                old,
                new,
            }));
        }
    }

    fn receive_event(&self, name: &str, payload: &str) -> anyhow::Result<()> {
        let listened = self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name);
        if !listened {
            return Ok(());
        }

        let event: HeatingEvent = serde_json::from_str(payload)
            .with_context(|| format!("invalid payload for event '{name}'"))?;
        self.send(HostMessage::Event(event));
        Ok(())
    }

    fn send(&self, message: HostMessage) {
        if self.dispatch.send(message).is_err() {
            warn!("dispatch loop is gone, dropping message");
        }
    }

    fn publish(&self, topic: String, retain: bool, payload: Vec<u8>) {
        if let Err(err) = self
            .mqtt
            .try_publish(topic.as_str(), QoS::AtLeastOnce, retain, payload)
        {
            warn!("mqtt publish to {topic} failed: {err}");
        }
    }
}

impl HomeAutomation for MqttHost {
    fn state(&self, entity_id: &EntityId) -> Option<String> {
        self.store.state(entity_id)
    }

    fn attribute(&self, entity_id: &EntityId, attribute: Attribute) -> Option<String> {
        self.store.attribute(entity_id, attribute.as_str())
    }

    fn subscribe(&self, subscription: Subscription) {
        if !self.filters.contains(&self.topics.entity_filter(&subscription.entity_id)) {
            warn!(entity = %subscription.entity_id, "subscription for an entity that is not mirrored");
        }
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscription);
    }

    fn listen_event(&self, name: &'static str) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
    }

    fn fire_event(&self, event: HeatingEvent) {
        match serde_json::to_vec(&event) {
            Ok(payload) => self.publish(self.topics.event(event.name()), false, payload),
            Err(err) => warn!("event serialization failed: {err}"),
        }
    }

    fn call_service(&self, call: ServiceCall) {
        debug!(service = call.service(), entity = %call.entity_id(), "calling service");
        match serde_json::to_vec(&call.data()) {
            Ok(payload) => self.publish(self.topics.service(&call), false, payload),
            Err(err) => warn!("service call serialization failed: {err}"),
        }
    }

    fn set_output(&self, output: Output) {
        let body = json!({ "state": output.state, "attributes": output.attributes });
        match serde_json::to_vec(&body) {
            Ok(payload) => self.publish(self.topics.output(&output.entity_id), true, payload),
            Err(err) => warn!("output serialization failed: {err}"),
        }
    }

    fn run_daily(&self, at: NaiveTime, weekdays: WeekdaySet, target: TimerTarget) -> TimerHandle {
        let handle = TimerHandle(self.next_timer.fetch_add(1, Ordering::Relaxed));
        let task = timers::spawn_daily(
            self.timezone,
            at,
            weekdays,
            handle,
            target,
            self.dispatch.clone(),
        );
        self.timers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, task);
        handle
    }

    fn cancel_timer(&self, handle: TimerHandle) {
        let task = self
            .timers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
        if let Some(task) = task {
            task.abort();
        }
    }

    fn now(&self) -> NaiveDateTime {
        timers::local_now(self.timezone)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn topics() -> Topics {
        Topics::new("homeassistant", "heating/")
    }

    #[test]
    fn parses_statestream_topics() {
        let topics = topics();
        assert_eq!(
            topics.parse("homeassistant/climate/living/state"),
            Some(TopicKind::State("climate.living".into()))
        );
        assert_eq!(
            topics.parse("homeassistant/climate/living/current_temperature"),
            Some(TopicKind::Attribute(
                "climate.living".into(),
                "current_temperature".to_string()
            ))
        );
        assert_eq!(
            topics.parse("heating/event/reapply"),
            Some(TopicKind::Event("reapply".to_string()))
        );
        assert_eq!(topics.parse("homeassistant/climate/state"), None);
        assert_eq!(topics.parse("heating/output/sensor.living_heating_control"), None);
        assert_eq!(topics.parse("homeassistantx/climate/living/state"), None);
    }

    #[test]
    fn builds_command_topics() {
        let topics = topics();
        let call = ServiceCall::SetTemperature {
            entity_id: "climate.living".into(),
            temperature: 21.0,
        };
        assert_eq!(topics.service(&call), "heating/service/climate/set_temperature");
        assert_eq!(
            topics.output(&"sensor.living_scheduled_change".into()),
            "heating/output/sensor.living_scheduled_change"
        );
        assert_eq!(
            topics.entity_filter(&"sensor.living_temp".into()),
            "homeassistant/sensor/living_temp/#"
        );
        assert_eq!(topics.event_filter(), "heating/event/+");
    }

    #[test]
    fn unwraps_json_attributes() {
        assert_eq!(decode_attribute("21.5"), "21.5");
        assert_eq!(decode_attribute("\"heat\""), "heat");
        assert_eq!(decode_attribute("[\"off\",\"heat\"]"), "[\"off\",\"heat\"]");
        assert_eq!(decode_attribute("not json"), "not json");
    }

    #[test]
    fn store_tracks_previous_values() {
        let store = EntityStore::default();
        let living: EntityId = "climate.living".into();

        assert_eq!(store.update(&living, None, Some("heat".to_string())), None);
        assert_eq!(
            store.update(&living, None, Some("off".to_string())),
            Some("heat".to_string())
        );
        assert_eq!(store.update(&living, Some("temperature"), Some("21".to_string())), None);
        assert_eq!(store.attribute(&living, "temperature").as_deref(), Some("21"));
        assert_eq!(store.update(&living, Some("temperature"), None), Some("21".to_string()));

        let radiator: EntityId = "climate.radiator".into();
        assert_eq!(store.missing([&living, &radiator]), vec![radiator.clone()]);
    }
}
