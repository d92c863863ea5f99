//! Per-match change tracking
//!
//! [`DirtyTrackingStore`] wraps a store and records, per match, which
//! entities were added, modified or removed since the last time the match's
//! changes were consumed. The snapshot cache uses this to patch a cached
//! snapshot instead of rebuilding it.
//!
//! Two rules hold for every interval:
//! - an entity created and deleted inside the interval is in no set
//! - an entity in `added` is never also in `modified`

use super::{EntityComponentStore, LockingStore};
use crate::error::StoreResult;
use log::trace;
use parking_lot::Mutex;
use shared::{ComponentId, EntityId, MatchId};
use std::collections::{BTreeSet, HashMap};

/// Changes accumulated for one match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyInfo {
    pub added: BTreeSet<EntityId>,
    pub modified: BTreeSet<EntityId>,
    pub removed: BTreeSet<EntityId>,
}

impl DirtyInfo {
    /// No entity changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Size of the three sets together, compared against the rebuild
    /// threshold by the snapshot cache.
    pub fn total_changes(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    /// An entity appeared or disappeared, as opposed to values changing.
    pub fn has_structural_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Added and modified entities, the ones whose values must be re-read.
    pub fn touched(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.added.iter().chain(self.modified.iter()).copied()
    }

    fn mark_added(&mut self, entity: EntityId) {
        self.added.insert(entity);
    }

    fn mark_modified(&mut self, entity: EntityId) {
        if !self.added.contains(&entity) {
            self.modified.insert(entity);
        }
    }

    fn mark_removed(&mut self, entity: EntityId) {
        self.modified.remove(&entity);
        // Created within this interval: nobody has seen it, so forget it.
        if !self.added.remove(&entity) {
            self.removed.insert(entity);
        }
    }
}

/// Access to accumulated changes.
///
/// Methods take `&self` so a reader holding a shared lock can consume; the
/// dirty maps carry their own mutex.
pub trait DirtyTracking {
    /// Returns and clears the changes recorded for `match_id`.
    fn consume_dirty_info(&self, match_id: MatchId) -> DirtyInfo;

    /// Returns the changes recorded for `match_id` without clearing them.
    fn peek_dirty_info(&self, match_id: MatchId) -> DirtyInfo;

    /// Forgets every recorded change in every match.
    fn clear_dirty_state(&self);
}

/// Store wrapper recording which entities each write touched.
///
/// Writes are forwarded first and recorded only when they succeed, so a
/// rejected command leaves no trace in the dirty sets.
#[derive(Debug)]
pub struct DirtyTrackingStore<S> {
    inner: S,
    dirty: Mutex<HashMap<MatchId, DirtyInfo>>,
}

impl<S: EntityComponentStore> DirtyTrackingStore<S> {
    /// Wraps `inner` with no recorded changes.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            dirty: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped store, for reads that should bypass tracking.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Matches with pending changes.
    pub fn dirty_matches(&self) -> Vec<MatchId> {
        self.dirty
            .lock()
            .iter()
            .filter(|(_, info)| !info.is_empty())
            .map(|(match_id, _)| *match_id)
            .collect()
    }

    fn record(&mut self, entity: EntityId, mark: fn(&mut DirtyInfo, EntityId)) {
        if let Some(match_id) = self.inner.match_of(entity) {
            mark(self.dirty.get_mut().entry(match_id).or_default(), entity);
        }
    }
}

impl<S: EntityComponentStore> DirtyTracking for DirtyTrackingStore<S> {
    fn consume_dirty_info(&self, match_id: MatchId) -> DirtyInfo {
        let info = self.dirty.lock().remove(&match_id).unwrap_or_default();
        if !info.is_empty() {
            trace!(
                "Consumed {} changes for {}",
                info.total_changes(),
                match_id
            );
        }
        info
    }

    fn peek_dirty_info(&self, match_id: MatchId) -> DirtyInfo {
        self.dirty
            .lock()
            .get(&match_id)
            .cloned()
            .unwrap_or_default()
    }

    fn clear_dirty_state(&self) {
        self.dirty.lock().clear();
    }
}

impl<S: EntityComponentStore + DirtyTracking> DirtyTracking for LockingStore<S> {
    fn consume_dirty_info(&self, match_id: MatchId) -> DirtyInfo {
        self.read().consume_dirty_info(match_id)
    }

    fn peek_dirty_info(&self, match_id: MatchId) -> DirtyInfo {
        self.read().peek_dirty_info(match_id)
    }

    fn clear_dirty_state(&self) {
        self.read().clear_dirty_state()
    }
}

impl<S: EntityComponentStore> EntityComponentStore for DirtyTrackingStore<S> {
    fn create_entity(&mut self, match_id: MatchId) -> StoreResult<EntityId> {
        let entity = self.inner.create_entity(match_id)?;
        self.dirty
            .get_mut()
            .entry(match_id)
            .or_default()
            .mark_added(entity);
        Ok(entity)
    }

    fn delete_entity(&mut self, entity: EntityId) -> StoreResult<()> {
        let match_id = self.inner.match_of(entity);
        self.inner.delete_entity(entity)?;
        if let Some(match_id) = match_id {
            self.dirty
                .get_mut()
                .entry(match_id)
                .or_default()
                .mark_removed(entity);
        }
        Ok(())
    }

    fn attach_component(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        value: f32,
    ) -> StoreResult<()> {
        self.inner.attach_component(entity, component, value)?;
        self.record(entity, DirtyInfo::mark_modified);
        Ok(())
    }

    fn attach_components(
        &mut self,
        entity: EntityId,
        components: &[ComponentId],
        values: &[f32],
    ) -> StoreResult<()> {
        self.inner.attach_components(entity, components, values)?;
        self.record(entity, DirtyInfo::mark_modified);
        Ok(())
    }

    fn remove_component(&mut self, entity: EntityId, component: ComponentId) -> StoreResult<()> {
        self.inner.remove_component(entity, component)?;
        self.record(entity, DirtyInfo::mark_modified);
        Ok(())
    }

    fn set_component_batch(
        &mut self,
        entities: &[EntityId],
        component: ComponentId,
        values: &[f32],
    ) -> StoreResult<()> {
        self.inner.set_component_batch(entities, component, values)?;
        for entity in entities {
            self.record(*entity, DirtyInfo::mark_modified);
        }
        Ok(())
    }

    fn reset(&mut self) {
        let live: Vec<(EntityId, Option<MatchId>)> = self
            .inner
            .entities_with_components(&[])
            .into_iter()
            .map(|entity| (entity, self.inner.match_of(entity)))
            .collect();
        self.inner.reset();

        let dirty = self.dirty.get_mut();
        for (entity, match_id) in live {
            if let Some(match_id) = match_id {
                dirty.entry(match_id).or_default().mark_removed(entity);
            }
        }
    }

    fn get_component(&self, entity: EntityId, component: ComponentId) -> f32 {
        self.inner.get_component(entity, component)
    }

    fn has_component(&self, entity: EntityId, component: ComponentId) -> bool {
        self.inner.has_component(entity, component)
    }

    fn get_components(
        &self,
        entity: EntityId,
        components: &[ComponentId],
        out: &mut [f32],
    ) -> StoreResult<()> {
        self.inner.get_components(entity, components, out)
    }

    fn get_component_batch(
        &self,
        entities: &[EntityId],
        component: ComponentId,
        out: &mut [f32],
    ) -> StoreResult<()> {
        self.inner.get_component_batch(entities, component, out)
    }

    fn entities_with_components(&self, components: &[ComponentId]) -> Vec<EntityId> {
        self.inner.entities_with_components(components)
    }

    fn match_entities_with_components(
        &self,
        match_id: MatchId,
        components: &[ComponentId],
    ) -> Vec<EntityId> {
        self.inner
            .match_entities_with_components(match_id, components)
    }

    fn contains(&self, entity: EntityId) -> bool {
        self.inner.contains(entity)
    }

    fn match_of(&self, entity: EntityId) -> Option<MatchId> {
        self.inner.match_of(entity)
    }

    fn entity_count(&self) -> usize {
        self.inner.entity_count()
    }

    fn max_entities(&self) -> usize {
        self.inner.max_entities()
    }

    fn component_type_count(&self) -> usize {
        self.inner.component_type_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::ArrayStore;

    const HEALTH: ComponentId = ComponentId(2);
    const M1: MatchId = MatchId(1);
    const M2: MatchId = MatchId(2);

    fn store() -> DirtyTrackingStore<ArrayStore> {
        DirtyTrackingStore::new(ArrayStore::new(1_000, 8))
    }

    #[test]
    fn test_create_marks_added_only() {
        let mut store = store();
        let entity = store.create_entity(M1).unwrap();
        store.attach_component(entity, HEALTH, 100.0).unwrap();

        let info = store.consume_dirty_info(M1);
        assert!(info.added.contains(&entity));
        assert!(info.modified.is_empty());
        assert!(info.removed.is_empty());
    }

    #[test]
    fn test_modification_after_consume() {
        let mut store = store();
        let entity = store.create_entity(M1).unwrap();
        store.consume_dirty_info(M1);

        store.attach_component(entity, HEALTH, 50.0).unwrap();
        let info = store.consume_dirty_info(M1);
        assert_eq!(info.modified, BTreeSet::from([entity]));
        assert!(!info.has_structural_changes());
    }

    #[test]
    fn test_transient_entity_is_invisible() {
        let mut store = store();
        let entity = store.create_entity(M1).unwrap();
        store.attach_component(entity, HEALTH, 1.0).unwrap();
        store.delete_entity(entity).unwrap();

        assert!(store.consume_dirty_info(M1).is_empty());
    }

    #[test]
    fn test_delete_of_known_entity_marks_removed() {
        let mut store = store();
        let entity = store.create_entity(M1).unwrap();
        store.consume_dirty_info(M1);

        store.attach_component(entity, HEALTH, 1.0).unwrap();
        store.delete_entity(entity).unwrap();
        let info = store.consume_dirty_info(M1);
        assert_eq!(info.removed, BTreeSet::from([entity]));
        assert!(info.modified.is_empty());
    }

    #[test]
    fn test_consume_is_idempotent() {
        let mut store = store();
        store.create_entity(M1).unwrap();

        assert_eq!(store.consume_dirty_info(M1).total_changes(), 1);
        assert!(store.consume_dirty_info(M1).is_empty());
    }

    #[test]
    fn test_peek_does_not_clear() {
        let mut store = store();
        let entity = store.create_entity(M1).unwrap();

        assert!(store.peek_dirty_info(M1).added.contains(&entity));
        assert!(store.peek_dirty_info(M1).added.contains(&entity));
        assert!(store.consume_dirty_info(M1).added.contains(&entity));
    }

    #[test]
    fn test_matches_are_isolated() {
        let mut store = store();
        let a = store.create_entity(M1).unwrap();
        let b = store.create_entity(M2).unwrap();

        let info = store.consume_dirty_info(M1);
        assert!(info.added.contains(&a));
        assert!(!info.added.contains(&b));
        assert_eq!(store.dirty_matches(), vec![M2]);
    }

    #[test]
    fn test_failed_writes_are_not_tracked() {
        let mut store = store();
        let missing = EntityId(404);
        assert_eq!(
            store.attach_component(missing, HEALTH, 1.0),
            Err(StoreError::EntityNotFound { entity: missing })
        );
        assert_eq!(
            store.delete_entity(missing),
            Err(StoreError::EntityNotFound { entity: missing })
        );
        let entity = store.create_entity(M1).unwrap();
        store.consume_dirty_info(M1);
        assert!(store
            .set_component_batch(&[entity, missing], HEALTH, &[1.0, 2.0])
            .is_err());
        assert!(store.consume_dirty_info(M1).is_empty());
    }

    #[test]
    fn test_batch_write_marks_each_entity() {
        let mut store = store();
        let a = store.create_entity(M1).unwrap();
        let b = store.create_entity(M1).unwrap();
        store.consume_dirty_info(M1);

        store.set_component_batch(&[a, b], HEALTH, &[1.0, 2.0]).unwrap();
        assert_eq!(store.consume_dirty_info(M1).modified, BTreeSet::from([a, b]));
    }

    #[test]
    fn test_reset_reports_removals() {
        let mut store = store();
        let seen = store.create_entity(M1).unwrap();
        store.consume_dirty_info(M1);
        store.create_entity(M1).unwrap();

        store.reset();
        let info = store.consume_dirty_info(M1);
        assert_eq!(info.removed, BTreeSet::from([seen]));
        assert!(info.added.is_empty());
    }

    #[test]
    fn test_clear_dirty_state() {
        let mut store = store();
        store.create_entity(M1).unwrap();
        store.create_entity(M2).unwrap();
        store.clear_dirty_state();

        assert!(store.peek_dirty_info(M1).is_empty());
        assert!(store.peek_dirty_info(M2).is_empty());
    }

    #[test]
    fn test_through_locking_handle() {
        let mut store = LockingStore::new(store());
        let entity = store.create_entity(M1).unwrap();
        assert!(store.peek_dirty_info(M1).added.contains(&entity));
        assert!(store.consume_dirty_info(M1).added.contains(&entity));
        assert!(store.consume_dirty_info(M1).is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Create(u64),
            Delete(usize),
            Touch(usize),
            Consume(u64),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (1..3u64).prop_map(Op::Create),
                any::<usize>().prop_map(Op::Delete),
                any::<usize>().prop_map(Op::Touch),
                (1..3u64).prop_map(Op::Consume),
            ]
        }

        proptest! {
            #[test]
            fn added_modified_removed_stay_disjoint(ops in prop::collection::vec(op(), 1..100)) {
                let mut store = store();
                let mut entities: Vec<EntityId> = Vec::new();
                // Entities created since the last consume of their match.
                let mut fresh: BTreeSet<EntityId> = BTreeSet::new();

                for op in ops {
                    let pick = |entities: &[EntityId], i: usize| {
                        entities.get(i % entities.len().max(1)).copied()
                    };
                    match op {
                        Op::Create(m) => {
                            let entity = store.create_entity(MatchId(m)).unwrap();
                            entities.push(entity);
                            fresh.insert(entity);
                        }
                        Op::Delete(i) => {
                            if let Some(entity) = pick(entities.as_slice(), i) {
                                let _ = store.delete_entity(entity);
                            }
                        }
                        Op::Touch(i) => {
                            if let Some(entity) = pick(entities.as_slice(), i) {
                                let _ = store.attach_component(entity, HEALTH, 1.0);
                            }
                        }
                        Op::Consume(m) => {
                            let info = store.consume_dirty_info(MatchId(m));
                            prop_assert!(info.added.is_disjoint(&info.modified));
                            prop_assert!(info.added.is_disjoint(&info.removed));
                            prop_assert!(info.modified.is_disjoint(&info.removed));
                            // Created and deleted within the interval: invisible.
                            for entity in &info.removed {
                                prop_assert!(!fresh.contains(entity));
                            }
                            fresh.retain(|e| store.inner().match_of(*e) != Some(MatchId(m)));
                        }
                    }
                }
            }
        }
    }
}
