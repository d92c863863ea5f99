//! Thread-safe handle over a store

use super::EntityComponentStore;
use crate::error::StoreResult;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use shared::{ComponentId, EntityId, MatchId};
use std::sync::Arc;

/// Cloneable handle that shares one store between the tick thread and any
/// number of readers.
///
/// Each trait call takes the lock for exactly that call. Callers that need
/// several reads against one consistent state use [`read`](Self::read).
#[derive(Debug)]
pub struct LockingStore<S> {
    inner: Arc<RwLock<S>>,
}

impl<S> Clone for LockingStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: EntityComponentStore> LockingStore<S> {
    /// Moves `store` behind a lock. Clones of the returned handle all see
    /// the same store.
    pub fn new(store: S) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    /// Shared view; writers wait until the guard is dropped.
    pub fn read(&self) -> RwLockReadGuard<'_, S> {
        self.inner.read()
    }

    /// Exclusive view for multi-step mutations.
    pub fn write(&self) -> RwLockWriteGuard<'_, S> {
        self.inner.write()
    }
}

impl<S: EntityComponentStore> EntityComponentStore for LockingStore<S> {
    fn create_entity(&mut self, match_id: MatchId) -> StoreResult<EntityId> {
        self.inner.write().create_entity(match_id)
    }

    fn delete_entity(&mut self, entity: EntityId) -> StoreResult<()> {
        self.inner.write().delete_entity(entity)
    }

    fn attach_component(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        value: f32,
    ) -> StoreResult<()> {
        self.inner.write().attach_component(entity, component, value)
    }

    fn attach_components(
        &mut self,
        entity: EntityId,
        components: &[ComponentId],
        values: &[f32],
    ) -> StoreResult<()> {
        self.inner
            .write()
            .attach_components(entity, components, values)
    }

    fn remove_component(&mut self, entity: EntityId, component: ComponentId) -> StoreResult<()> {
        self.inner.write().remove_component(entity, component)
    }

    fn set_component_batch(
        &mut self,
        entities: &[EntityId],
        component: ComponentId,
        values: &[f32],
    ) -> StoreResult<()> {
        self.inner
            .write()
            .set_component_batch(entities, component, values)
    }

    fn reset(&mut self) {
        self.inner.write().reset()
    }

    fn get_component(&self, entity: EntityId, component: ComponentId) -> f32 {
        self.inner.read().get_component(entity, component)
    }

    fn has_component(&self, entity: EntityId, component: ComponentId) -> bool {
        self.inner.read().has_component(entity, component)
    }

    fn get_components(
        &self,
        entity: EntityId,
        components: &[ComponentId],
        out: &mut [f32],
    ) -> StoreResult<()> {
        self.inner.read().get_components(entity, components, out)
    }

    fn get_component_batch(
        &self,
        entities: &[EntityId],
        component: ComponentId,
        out: &mut [f32],
    ) -> StoreResult<()> {
        self.inner
            .read()
            .get_component_batch(entities, component, out)
    }

    fn entities_with_components(&self, components: &[ComponentId]) -> Vec<EntityId> {
        self.inner.read().entities_with_components(components)
    }

    fn match_entities_with_components(
        &self,
        match_id: MatchId,
        components: &[ComponentId],
    ) -> Vec<EntityId> {
        self.inner
            .read()
            .match_entities_with_components(match_id, components)
    }

    fn contains(&self, entity: EntityId) -> bool {
        self.inner.read().contains(entity)
    }

    fn match_of(&self, entity: EntityId) -> Option<MatchId> {
        self.inner.read().match_of(entity)
    }

    fn entity_count(&self) -> usize {
        self.inner.read().entity_count()
    }

    fn max_entities(&self) -> usize {
        self.inner.read().max_entities()
    }

    fn component_type_count(&self) -> usize {
        self.inner.read().component_type_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::ArrayStore;
    use std::thread;

    const HEALTH: ComponentId = ComponentId(2);

    #[test]
    fn test_same_contract_as_inner_store() {
        let mut store = LockingStore::new(ArrayStore::new(2, 8));
        let entity = store.create_entity(MatchId(1)).unwrap();
        store.attach_component(entity, HEALTH, 9.0).unwrap();

        assert_eq!(store.get_component(entity, HEALTH), 9.0);
        assert_eq!(
            store.attach_component(EntityId(50), HEALTH, 1.0),
            Err(StoreError::EntityNotFound {
                entity: EntityId(50)
            })
        );
        store.create_entity(MatchId(1)).unwrap();
        assert!(matches!(
            store.create_entity(MatchId(1)),
            Err(StoreError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_clones_share_state() {
        let mut writer = LockingStore::new(ArrayStore::new(10, 8));
        let reader = writer.clone();
        let entity = writer.create_entity(MatchId(3)).unwrap();

        assert!(reader.contains(entity));
        assert_eq!(reader.read().entity_count(), 1);
    }

    #[test]
    fn test_concurrent_readers_with_single_writer() {
        let mut writer = LockingStore::new(ArrayStore::new(10_000, 8));
        let entity = writer.create_entity(MatchId(1)).unwrap();
        writer.attach_component(entity, HEALTH, 0.0).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reader = writer.clone();
                thread::spawn(move || {
                    let mut last = 0.0;
                    for _ in 0..1_000 {
                        let value = reader.get_component(entity, HEALTH);
                        // The writer only increases the value.
                        assert!(value >= last);
                        last = value;
                    }
                })
            })
            .collect();

        for i in 1..=1_000 {
            writer.attach_component(entity, HEALTH, i as f32).unwrap();
        }
        for handle in readers {
            handle.join().unwrap();
        }
        assert_eq!(writer.get_component(entity, HEALTH), 1_000.0);
    }
}
