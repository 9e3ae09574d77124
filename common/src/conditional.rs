use std::{collections::BTreeMap, sync::Arc};

use crate::{schedule::Schedule, types::EntityId};

/// Maps states of one condition entity to schedules.
#[derive(Debug, Clone)]
pub struct ConditionalRule {
    entity_id: EntityId,
    values: BTreeMap<String, Arc<Schedule>>,
}

impl ConditionalRule {
    pub fn new(entity_id: EntityId, values: BTreeMap<String, Arc<Schedule>>) -> Self {
        Self { entity_id, values }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn schedule_for(&self, state: &str) -> Option<&Arc<Schedule>> {
        self.values.get(state)
    }
}

/// Picks a room's active schedule: the first rule (in declaration order)
/// whose entity is in one of its listed states, else the default. Later
/// matching rules are ignored rather than merged.
#[derive(Debug, Clone)]
pub struct ConditionalResolver {
    default: Arc<Schedule>,
    rules: Vec<ConditionalRule>,
}

impl ConditionalResolver {
    pub fn new(default: Arc<Schedule>, rules: Vec<ConditionalRule>) -> Self {
        Self { default, rules }
    }

    pub fn default_schedule(&self) -> &Arc<Schedule> {
        &self.default
    }

    pub fn rules(&self) -> &[ConditionalRule] {
        &self.rules
    }

    pub fn sources(&self) -> impl Iterator<Item = &EntityId> {
        self.rules.iter().map(ConditionalRule::entity_id)
    }

    pub fn schedules(&self) -> impl Iterator<Item = &Arc<Schedule>> {
        std::iter::once(&self.default).chain(self.rules.iter().flat_map(|rule| rule.values.values()))
    }

    pub fn resolve<F>(&self, state_of: F) -> &Arc<Schedule>
    where
        F: Fn(&EntityId) -> Option<String>,
    {
        self.rules
            .iter()
            .find_map(|rule| {
                state_of(&rule.entity_id).and_then(|state| rule.schedule_for(&state))
            })
            .unwrap_or(&self.default)
    }
}
