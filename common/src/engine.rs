use std::collections::HashMap;

use tracing::{debug, info};

use crate::{
    config::HeatingSetup,
    error::HeatingError,
    host::{SharedHost, StateChange, Subscription, TimerHandle, TimerTarget},
    room::{Room, Trigger},
    types::{HeatingEvent, RoomStatus},
};

/// Owns every room and routes host notifications to them. The host must
/// call into the engine from one task at a time.
pub struct HeatingEngine {
    host: SharedHost,
    rooms: Vec<Room>,
    routes: HashMap<Subscription, Vec<(usize, Trigger)>>,
}

impl HeatingEngine {
    /// Builds all rooms. Fails if any referenced entity is unknown to the
    /// host.
    pub fn new(setup: HeatingSetup, host: SharedHost) -> Result<Self, HeatingError> {
        for room in &setup.rooms {
            if let Some(missing) = room
                .referenced_entities()
                .into_iter()
                .find(|entity_id| host.state(entity_id).is_none())
            {
                return Err(HeatingError::EntityNotFound {
                    room: room.name.clone(),
                    entity_id: missing.clone(),
                });
            }
        }

        let rooms: Vec<Room> = setup
            .rooms
            .into_iter()
            .map(|room| Room::new(room, host.clone()))
            .collect();

        let mut routes: HashMap<Subscription, Vec<(usize, Trigger)>> = HashMap::new();
        for (index, room) in rooms.iter().enumerate() {
            for (subscription, trigger) in room.subscriptions() {
                routes.entry(subscription).or_default().push((index, trigger));
            }
        }

        Ok(Self {
            host,
            rooms,
            routes,
        })
    }

    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subscriptions: Vec<_> = self.routes.keys().cloned().collect();
        subscriptions.sort();
        subscriptions
    }

    pub fn start(&mut self) {
        for subscription in self.subscriptions() {
            self.host.subscribe(subscription);
        }
        self.host.listen_event(HeatingEvent::REAPPLY);

        for room in &mut self.rooms {
            room.start();
            info!(room = room.name(), schedule = room.active_schedule().name(), "room started");
        }
    }

    pub fn stop(&mut self) {
        for room in &mut self.rooms {
            room.stop();
        }
    }

    pub fn handle_state_change(&mut self, change: &StateChange) {
        if change.old == change.new {
            return;
        }
        let Some(routes) = self.routes.get(&change.subscription()) else {
            debug!(entity = %change.entity_id, "no room listens to this entity");
            return;
        };

        for &(index, trigger) in routes {
            self.rooms[index].handle(trigger, change);
        }
    }

    pub fn handle_timer(&mut self, handle: TimerHandle, target: &TimerTarget) -> Result<(), HeatingError> {
        self.room_mut(&target.room)?.on_timer(handle, target);
        Ok(())
    }

    pub fn handle_event(&mut self, event: &HeatingEvent) -> Result<(), HeatingError> {
        match event {
            HeatingEvent::Reapply { room: None } => {
                info!("reapplying schedules for all rooms");
                for room in &mut self.rooms {
                    room.resolve(true);
                }
            }
            HeatingEvent::Reapply { room: Some(name) } => {
                info!(room = %name, "reapplying schedule");
                self.room_mut(name)?.resolve(true);
            }
            HeatingEvent::ScheduleChanged { .. } => {}
        }
        Ok(())
    }

    pub fn status(&self) -> Vec<RoomStatus> {
        self.rooms.iter().map(Room::status).collect()
    }

    pub fn room_status(&self, name: &str) -> Result<RoomStatus, HeatingError> {
        self.rooms
            .iter()
            .find(|room| room.name() == name)
            .map(Room::status)
            .ok_or_else(|| HeatingError::UnknownRoom(name.to_string()))
    }

    fn room_mut(&mut self, name: &str) -> Result<&mut Room, HeatingError> {
        self.rooms
            .iter_mut()
            .find(|room| room.name() == name)
            .ok_or_else(|| HeatingError::UnknownRoom(name.to_string()))
    }
}
