//! Match-scoped snapshots and their incremental maintenance
//!
//! A [`Snapshot`] is an immutable view of one match at one tick, organized
//! as module → component → (entity, value). Columns are persistent ordered
//! maps, so cloning a snapshot is O(1) and patching it touches only the
//! changed entries. Entity order is ascending id everywhere.
//!
//! Every snapshot also records the `OWNER_ID` of its entities, so a
//! published match snapshot can be narrowed to one player with
//! [`Snapshot::for_player`] without touching the store again.
//!
//! - [`SnapshotBuilder`] produces snapshots from scratch
//! - [`CachingSnapshotProvider`] keeps one snapshot per match and patches it
//!   from dirty-tracking information
//! - [`DeltaCompressor`] turns two snapshots into a wire delta

mod builder;
mod caching;
mod delta;

pub use builder::SnapshotBuilder;
pub use caching::{CachingSnapshotProvider, RebuildReason, RefreshKind, SnapshotMetrics, SnapshotRefresh};
pub use delta::DeltaCompressor;

use crate::store::{is_null, EntityComponentStore};
use im::{OrdMap, OrdSet};
use shared::{
    ComponentId, EntityId, EntityState, MatchId, ModuleEntities, PlayerId, SnapshotMessage, Tick,
};
use std::collections::BTreeMap;

/// Player owning `entity`, read from its `OWNER_ID` component.
pub(crate) fn read_owner<S>(store: &S, entity: EntityId) -> Option<PlayerId>
where
    S: EntityComponentStore + ?Sized,
{
    let value = store.get_component(entity, ComponentId::OWNER_ID);
    if is_null(value) || value < 0.0 {
        None
    } else {
        Some(value as PlayerId)
    }
}

/// Values of one component for the entities of a module.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentColumn {
    pub id: ComponentId,
    pub name: String,
    /// Non-null values only.
    pub values: OrdMap<EntityId, f32>,
}

/// One module's share of a snapshot.
///
/// An entity is listed when it carries the module's flag, even if none of
/// the module's components is set on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSnapshot {
    pub name: String,
    pub flag: ComponentId,
    /// Entities of the match carrying the module's flag.
    pub entities: OrdSet<EntityId>,
    pub components: Vec<ComponentColumn>,
}

impl ModuleSnapshot {
    pub fn column(&self, component: &str) -> Option<&ComponentColumn> {
        self.components.iter().find(|c| c.name == component)
    }

    /// Published values of one entity, keyed by component name.
    pub fn entity_values(&self, entity: EntityId) -> Option<BTreeMap<String, f32>> {
        if !self.entities.contains(&entity) {
            return None;
        }
        Some(
            self.components
                .iter()
                .filter_map(|column| {
                    column
                        .values
                        .get(&entity)
                        .map(|value| (column.name.clone(), *value))
                })
                .collect(),
        )
    }
}

/// State of one match after one completed tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub match_id: MatchId,
    pub tick: Tick,
    pub modules: Vec<ModuleSnapshot>,
    /// Owner of every published entity that carries `OWNER_ID`.
    pub owners: OrdMap<EntityId, PlayerId>,
}

impl Snapshot {
    /// A snapshot with no modules and no entities.
    pub fn empty(match_id: MatchId, tick: Tick) -> Self {
        Self {
            match_id,
            tick,
            modules: Vec::new(),
            owners: OrdMap::new(),
        }
    }

    /// Player owning `entity`, if it is published and owned.
    pub fn owner(&self, entity: EntityId) -> Option<PlayerId> {
        self.owners.get(&entity).copied()
    }

    /// The same tick restricted to entities owned by `player`.
    ///
    /// Module and component structure is kept, so an empty result still
    /// names every module.
    pub fn for_player(&self, player: PlayerId) -> Snapshot {
        let owners: OrdMap<EntityId, PlayerId> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == player)
            .map(|(entity, owner)| (*entity, *owner))
            .collect();

        let modules = self
            .modules
            .iter()
            .map(|module| ModuleSnapshot {
                name: module.name.clone(),
                flag: module.flag,
                entities: module
                    .entities
                    .iter()
                    .filter(|entity| owners.contains_key(*entity))
                    .copied()
                    .collect(),
                components: module
                    .components
                    .iter()
                    .map(|column| ComponentColumn {
                        id: column.id,
                        name: column.name.clone(),
                        values: column
                            .values
                            .iter()
                            .filter(|(entity, _)| owners.contains_key(*entity))
                            .map(|(entity, value)| (*entity, *value))
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        Snapshot {
            match_id: self.match_id,
            tick: self.tick,
            modules,
            owners,
        }
    }

    pub fn module(&self, name: &str) -> Option<&ModuleSnapshot> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Published value of one component, `None` when absent or unknown.
    pub fn value(&self, module: &str, component: &str, entity: EntityId) -> Option<f32> {
        self.module(module)?
            .column(component)?
            .values
            .get(&entity)
            .copied()
    }

    /// Distinct entities across all modules, ascending.
    pub fn entity_ids(&self) -> OrdSet<EntityId> {
        self.modules
            .iter()
            .fold(OrdSet::new(), |acc, module| acc.union(module.entities.clone()))
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.modules.iter().any(|m| m.entities.contains(&entity))
    }

    /// Sum of per-module entity counts; an O(modules) size estimate.
    pub fn membership_count(&self) -> usize {
        self.modules.iter().map(|m| m.entities.len()).sum()
    }

    /// Values of one entity merged across modules, or `None` when no module
    /// publishes it.
    pub fn entity_values(&self, entity: EntityId) -> Option<BTreeMap<String, f32>> {
        let mut merged: Option<BTreeMap<String, f32>> = None;
        for module in &self.modules {
            if let Some(values) = module.entity_values(entity) {
                merged.get_or_insert_with(BTreeMap::new).extend(values);
            }
        }
        merged
    }

    /// Every published entity with its merged values.
    pub fn flatten(&self) -> BTreeMap<EntityId, BTreeMap<String, f32>> {
        let mut flat: BTreeMap<EntityId, BTreeMap<String, f32>> = BTreeMap::new();
        for module in &self.modules {
            for entity in module.entities.iter() {
                flat.entry(*entity).or_default();
            }
            for column in &module.components {
                for (entity, value) in column.values.iter() {
                    flat.entry(*entity)
                        .or_default()
                        .insert(column.name.clone(), *value);
                }
            }
        }
        flat
    }

    /// Wire form, one entity list per module.
    pub fn to_message(&self) -> SnapshotMessage {
        let modules = self
            .modules
            .iter()
            .map(|module| {
                let entities = module
                    .entities
                    .iter()
                    .map(|entity| EntityState {
                        id: *entity,
                        components: module.entity_values(*entity).unwrap_or_default(),
                    })
                    .collect();
                (module.name.clone(), ModuleEntities { entities })
            })
            .collect();

        SnapshotMessage {
            tick: self.tick,
            match_id: self.match_id,
            modules,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(id: u32, name: &str, values: &[(u64, f32)]) -> ComponentColumn {
        ComponentColumn {
            id: ComponentId(id),
            name: name.to_string(),
            values: values.iter().map(|(e, v)| (EntityId(*e), *v)).collect(),
        }
    }

    fn sample() -> Snapshot {
        Snapshot {
            match_id: MatchId(1),
            tick: 5,
            modules: vec![
                ModuleSnapshot {
                    name: "combat".to_string(),
                    flag: ComponentId(2),
                    entities: [EntityId(1), EntityId(2)].into_iter().collect(),
                    components: vec![
                        column(2, "COMBATANT", &[(1, 1.0), (2, 1.0)]),
                        column(3, "HEALTH", &[(1, 100.0)]),
                    ],
                },
                ModuleSnapshot {
                    name: "movement".to_string(),
                    flag: ComponentId(4),
                    entities: [EntityId(2), EntityId(3)].into_iter().collect(),
                    components: vec![column(5, "SPEED", &[(2, 3.0), (3, 4.0)])],
                },
            ],
            owners: [(EntityId(1), 7u32), (EntityId(2), 8u32), (EntityId(3), 7u32)]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn test_lookup_helpers() {
        let snapshot = sample();
        assert_eq!(snapshot.value("combat", "HEALTH", EntityId(1)), Some(100.0));
        assert_eq!(snapshot.value("combat", "HEALTH", EntityId(2)), None);
        assert_eq!(snapshot.value("nope", "HEALTH", EntityId(1)), None);
        assert!(snapshot.contains(EntityId(3)));
        assert!(!snapshot.contains(EntityId(9)));
        assert_eq!(snapshot.membership_count(), 4);
        assert_eq!(
            snapshot.entity_ids().into_iter().collect::<Vec<_>>(),
            vec![EntityId(1), EntityId(2), EntityId(3)]
        );
    }

    #[test]
    fn test_entity_values_merge_modules() {
        let snapshot = sample();
        let values = snapshot.entity_values(EntityId(2)).unwrap();
        assert_eq!(values.get("COMBATANT"), Some(&1.0));
        assert_eq!(values.get("SPEED"), Some(&3.0));
        assert!(!values.contains_key("HEALTH"));
        assert!(snapshot.entity_values(EntityId(9)).is_none());
        assert_eq!(snapshot.flatten().len(), 3);
    }

    #[test]
    fn test_for_player_keeps_owned_entities() {
        let snapshot = sample();
        assert_eq!(snapshot.owner(EntityId(2)), Some(8));

        let owned = snapshot.for_player(7);
        assert_eq!(owned.tick, 5);
        assert_eq!(owned.modules.len(), 2);
        assert_eq!(
            owned.entity_ids().into_iter().collect::<Vec<_>>(),
            vec![EntityId(1), EntityId(3)]
        );
        assert_eq!(owned.value("combat", "HEALTH", EntityId(1)), Some(100.0));
        assert_eq!(owned.value("combat", "COMBATANT", EntityId(2)), None);
        assert_eq!(owned.value("movement", "SPEED", EntityId(3)), Some(4.0));
        assert_eq!(owned.owners.len(), 2);

        let nobody = snapshot.for_player(99);
        assert_eq!(nobody.membership_count(), 0);
        assert!(nobody.module("combat").is_some());
    }

    #[test]
    fn test_to_message() {
        let message = sample().to_message();
        assert_eq!(message.tick, 5);
        assert_eq!(message.match_id, MatchId(1));

        let combat = &message.modules["combat"].entities;
        assert_eq!(combat.len(), 2);
        assert_eq!(combat[0].id, EntityId(1));
        assert_eq!(combat[0].components["HEALTH"], 100.0);
        assert!(!combat[1].components.contains_key("HEALTH"));
    }
}
