//! Full snapshot construction

use super::{read_owner, ComponentColumn, ModuleSnapshot, Snapshot};
use crate::module::ModuleDescriptor;
use crate::store::{is_null, EntityComponentStore};
use im::{OrdMap, OrdSet};
use log::trace;
use shared::{EntityId, MatchId, PlayerId, Tick};

/// Builds snapshots by querying the store directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotBuilder;

impl SnapshotBuilder {
    pub fn new() -> Self {
        SnapshotBuilder
    }

    /// Reads every module's entities and published components for `match_id`.
    ///
    /// The caller holds whatever lock makes `store` a consistent view; the
    /// builder itself never mutates it.
    pub fn build<S>(
        &self,
        store: &S,
        modules: &[ModuleDescriptor],
        match_id: MatchId,
        tick: Tick,
    ) -> Snapshot
    where
        S: EntityComponentStore + ?Sized,
    {
        let modules: Vec<ModuleSnapshot> = modules
            .iter()
            .map(|module| self.build_module(store, module, match_id, |_| true))
            .collect();

        let mut snapshot = Snapshot {
            match_id,
            tick,
            modules,
            owners: OrdMap::new(),
        };
        snapshot.owners = snapshot
            .entity_ids()
            .into_iter()
            .filter_map(|entity| read_owner(store, entity).map(|owner| (entity, owner)))
            .collect();
        trace!(
            "Built snapshot for {} at tick {} ({} memberships)",
            match_id,
            tick,
            snapshot.membership_count()
        );
        snapshot
    }

    /// Like [`build`](Self::build), keeping only entities whose `OWNER_ID`
    /// is `player`. Entities without an owner are never included.
    pub fn build_for_player<S>(
        &self,
        store: &S,
        modules: &[ModuleDescriptor],
        match_id: MatchId,
        player: PlayerId,
        tick: Tick,
    ) -> Snapshot
    where
        S: EntityComponentStore + ?Sized,
    {
        let owned = |entity: EntityId| read_owner(store, entity) == Some(player);
        let modules: Vec<ModuleSnapshot> = modules
            .iter()
            .map(|module| self.build_module(store, module, match_id, owned))
            .collect();

        let mut snapshot = Snapshot {
            match_id,
            tick,
            modules,
            owners: OrdMap::new(),
        };
        snapshot.owners = snapshot
            .entity_ids()
            .into_iter()
            .map(|entity| (entity, player))
            .collect();
        trace!(
            "Built snapshot of player {} in {} at tick {} ({} memberships)",
            player,
            match_id,
            tick,
            snapshot.membership_count()
        );
        snapshot
    }

    fn build_module<S, F>(
        &self,
        store: &S,
        module: &ModuleDescriptor,
        match_id: MatchId,
        keep: F,
    ) -> ModuleSnapshot
    where
        S: EntityComponentStore + ?Sized,
        F: Fn(EntityId) -> bool,
    {
        let entities: Vec<EntityId> = store
            .match_entities_with_components(match_id, &[module.flag.id])
            .into_iter()
            .filter(|entity| keep(*entity))
            .collect();
        let mut buffer = vec![0.0f32; entities.len()];

        let components = module
            .components
            .iter()
            .map(|component| {
                let values: OrdMap<EntityId, f32> = match store.get_component_batch(
                    &entities,
                    component.id,
                    &mut buffer,
                ) {
                    Ok(()) => entities
                        .iter()
                        .zip(buffer.iter())
                        .filter(|(_, value)| !is_null(**value))
                        .map(|(entity, value)| (*entity, *value))
                        .collect(),
                    // Buffer is sized from `entities`, so this is unreachable.
                    Err(_) => OrdMap::new(),
                };
                ComponentColumn {
                    id: component.id,
                    name: component.name.clone(),
                    values,
                }
            })
            .collect();

        ModuleSnapshot {
            name: module.name.clone(),
            flag: module.flag.id,
            entities: entities.into_iter().collect::<OrdSet<_>>(),
            components,
        }
    }
}
