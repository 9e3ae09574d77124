use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Mode key to target temperature, e.g. `eco -> 18.0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModeTable(BTreeMap<String, f32>);

impl ModeTable {
    /// `overrides` win on key collision.
    pub fn merged(defaults: &Self, overrides: &Self) -> Self {
        let mut merged = defaults.0.clone();
        merged.extend(overrides.0.iter().map(|(mode, temp)| (mode.clone(), *temp)));
        Self(merged)
    }

    pub fn temperature(&self, mode: &str) -> Option<f32> {
        self.0.get(mode).copied()
    }

    pub fn contains(&self, mode: &str) -> bool {
        self.0.contains_key(mode)
    }
}

impl<S: Into<String>> FromIterator<(S, f32)> for ModeTable {
    fn from_iter<I: IntoIterator<Item = (S, f32)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(mode, temp)| (mode.into(), temp)).collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn room_overrides_win() {
        let defaults: ModeTable = [("eco", 18.0), ("comfort", 21.0)].into_iter().collect();
        let overrides: ModeTable = [("comfort", 22.5), ("boost", 24.0)].into_iter().collect();

        let merged = ModeTable::merged(&defaults, &overrides);

        assert_eq!(merged.temperature("eco"), Some(18.0));
        assert_eq!(merged.temperature("comfort"), Some(22.5));
        assert_eq!(merged.temperature("boost"), Some(24.0));
        assert_eq!(merged.temperature("away"), None);
        assert_eq!(defaults.temperature("comfort"), Some(21.0));
    }
}
