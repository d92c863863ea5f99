//! Client-side copy of one match, kept current from snapshots and deltas

use log::debug;
use shared::{DeltaMessage, EntityId, MatchId, SnapshotMessage, Tick};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MirrorError {
    #[error("no snapshot applied yet, cannot apply delta from tick {base_tick}")]
    NoBaseline { base_tick: Tick },

    #[error("delta is based on tick {actual}, mirror is at tick {expected}")]
    BaseTickMismatch { expected: Tick, actual: Tick },

    #[error("message for {actual} applied to mirror of {expected}")]
    MatchMismatch { expected: MatchId, actual: MatchId },
}

/// Published values of every entity of a match, merged across modules.
#[derive(Debug, Default, Clone)]
pub struct MatchMirror {
    match_id: Option<MatchId>,
    tick: Option<Tick>,
    entities: BTreeMap<EntityId, BTreeMap<String, f32>>,
}

impl MatchMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror bound to one match; messages for other matches are rejected.
    pub fn for_match(match_id: MatchId) -> Self {
        Self {
            match_id: Some(match_id),
            ..Self::default()
        }
    }

    /// Replaces the whole mirror.
    pub fn apply_snapshot(&mut self, snapshot: &SnapshotMessage) -> Result<(), MirrorError> {
        self.check_match(snapshot.match_id)?;

        self.entities.clear();
        for module in snapshot.modules.values() {
            for entity in &module.entities {
                self.entities
                    .entry(entity.id)
                    .or_default()
                    .extend(entity.components.iter().map(|(k, v)| (k.clone(), *v)));
            }
        }
        self.match_id = Some(snapshot.match_id);
        self.tick = Some(snapshot.tick);
        debug!(
            "Applied snapshot of {} at tick {} ({} entities)",
            snapshot.match_id,
            snapshot.tick,
            self.entities.len()
        );
        Ok(())
    }

    /// Applies a delta on top of the snapshot it was computed from. A delta
    /// for any other tick leaves the mirror untouched; the caller resyncs.
    pub fn apply_delta(&mut self, delta: &DeltaMessage) -> Result<(), MirrorError> {
        self.check_match(delta.match_id)?;
        let current = self.tick.ok_or(MirrorError::NoBaseline {
            base_tick: delta.base_tick,
        })?;
        if current != delta.base_tick {
            return Err(MirrorError::BaseTickMismatch {
                expected: current,
                actual: delta.base_tick,
            });
        }

        for entity in &delta.removed {
            self.entities.remove(entity);
        }
        for entity in &delta.added {
            self.entities.insert(entity.id, entity.components.clone());
        }
        for change in &delta.modified {
            let values = self.entities.entry(change.id).or_default();
            for name in &change.cleared {
                values.remove(name);
            }
            values.extend(change.components.iter().map(|(k, v)| (k.clone(), *v)));
        }
        self.tick = Some(delta.tick);
        Ok(())
    }

    fn check_match(&self, actual: MatchId) -> Result<(), MirrorError> {
        match self.match_id {
            Some(expected) if expected != actual => {
                Err(MirrorError::MatchMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }

    pub fn match_id(&self) -> Option<MatchId> {
        self.match_id
    }

    /// Tick of the last applied message.
    pub fn tick(&self) -> Option<Tick> {
        self.tick
    }

    pub fn entity(&self, id: EntityId) -> Option<&BTreeMap<String, f32>> {
        self.entities.get(&id)
    }

    pub fn value(&self, id: EntityId, component: &str) -> Option<f32> {
        self.entities.get(&id)?.get(component).copied()
    }

    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &BTreeMap<String, f32>)> {
        self.entities.iter().map(|(id, values)| (*id, values))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{EntityChange, EntityState, ModuleEntities};

    fn state(id: u64, values: &[(&str, f32)]) -> EntityState {
        EntityState {
            id: EntityId(id),
            components: values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    fn snapshot(tick: Tick) -> SnapshotMessage {
        let mut modules = BTreeMap::new();
        modules.insert(
            "combat".to_string(),
            ModuleEntities {
                entities: vec![state(1, &[("HEALTH", 100.0)]), state(2, &[("HEALTH", 80.0)])],
            },
        );
        modules.insert(
            "movement".to_string(),
            ModuleEntities {
                entities: vec![state(1, &[("POSITION_X", 3.0)])],
            },
        );
        SnapshotMessage {
            tick,
            match_id: MatchId(1),
            modules,
        }
    }

    #[test]
    fn test_snapshot_merges_modules() {
        let mut mirror = MatchMirror::new();
        mirror.apply_snapshot(&snapshot(5)).unwrap();

        assert_eq!(mirror.len(), 2);
        assert_eq!(mirror.tick(), Some(5));
        assert_eq!(mirror.value(EntityId(1), "HEALTH"), Some(100.0));
        assert_eq!(mirror.value(EntityId(1), "POSITION_X"), Some(3.0));
        assert_eq!(mirror.value(EntityId(2), "POSITION_X"), None);
    }

    #[test]
    fn test_delta_applies_on_matching_base() {
        let mut mirror = MatchMirror::new();
        mirror.apply_snapshot(&snapshot(5)).unwrap();

        let delta = DeltaMessage {
            tick: 6,
            base_tick: 5,
            match_id: MatchId(1),
            added: vec![state(3, &[("HEALTH", 10.0)])],
            modified: vec![EntityChange {
                id: EntityId(1),
                components: [("HEALTH".to_string(), 50.0)].into_iter().collect(),
                cleared: vec!["POSITION_X".to_string()],
            }],
            removed: vec![EntityId(2)],
        };
        mirror.apply_delta(&delta).unwrap();

        assert_eq!(mirror.tick(), Some(6));
        assert_eq!(mirror.value(EntityId(1), "HEALTH"), Some(50.0));
        assert_eq!(mirror.value(EntityId(1), "POSITION_X"), None);
        assert!(mirror.entity(EntityId(2)).is_none());
        assert_eq!(mirror.value(EntityId(3), "HEALTH"), Some(10.0));
    }

    #[test]
    fn test_delta_on_wrong_base_is_rejected() {
        let mut mirror = MatchMirror::new();
        let delta = DeltaMessage::empty(MatchId(1), 5, 6);
        assert_eq!(
            mirror.apply_delta(&delta),
            Err(MirrorError::NoBaseline { base_tick: 5 })
        );

        mirror.apply_snapshot(&snapshot(4)).unwrap();
        assert_eq!(
            mirror.apply_delta(&delta),
            Err(MirrorError::BaseTickMismatch {
                expected: 4,
                actual: 5
            })
        );
        assert_eq!(mirror.tick(), Some(4));
    }

    #[test]
    fn test_other_match_is_rejected() {
        let mut mirror = MatchMirror::for_match(MatchId(2));
        assert_eq!(
            mirror.apply_snapshot(&snapshot(1)),
            Err(MirrorError::MatchMismatch {
                expected: MatchId(2),
                actual: MatchId(1)
            })
        );
        assert!(mirror.is_empty());
    }
}
