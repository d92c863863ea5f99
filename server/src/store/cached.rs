//! Memoized component intersection queries

use super::EntityComponentStore;
use crate::error::StoreResult;
use parking_lot::Mutex;
use shared::{ComponentId, EntityId, MatchId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryKey {
    match_id: Option<MatchId>,
    components: Vec<ComponentId>,
}

impl QueryKey {
    fn new(match_id: Option<MatchId>, components: &[ComponentId]) -> Self {
        let mut components = components.to_vec();
        components.sort_unstable();
        components.dedup();
        Self {
            match_id,
            components,
        }
    }
}

/// Counters of a [`QueryCacheStore`] since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Queries currently memoized.
    pub entries: usize,
}

/// Caches `entities_with_components` results until a write could change them.
///
/// Creating or deleting an entity drops every cached query; attaching or
/// removing a component drops only the queries that mention it.
#[derive(Debug)]
pub struct QueryCacheStore<S> {
    inner: S,
    queries: Mutex<HashMap<QueryKey, Vec<EntityId>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: EntityComponentStore> QueryCacheStore<S> {
    /// Wraps `inner` with an empty query cache.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            queries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> QueryCacheStats {
        QueryCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.queries.lock().len(),
        }
    }

    fn invalidate_all(&mut self) {
        self.queries.get_mut().clear();
    }

    fn invalidate_component(&mut self, component: ComponentId) {
        self.queries
            .get_mut()
            .retain(|key, _| !key.components.contains(&component));
    }

    fn cached(&self, key: QueryKey, query: impl FnOnce(&S) -> Vec<EntityId>) -> Vec<EntityId> {
        if let Some(entities) = self.queries.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return entities.clone();
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let entities = query(&self.inner);
        self.queries.lock().insert(key, entities.clone());
        entities
    }
}

impl<S: EntityComponentStore> EntityComponentStore for QueryCacheStore<S> {
    fn create_entity(&mut self, match_id: MatchId) -> StoreResult<EntityId> {
        let entity = self.inner.create_entity(match_id)?;
        self.invalidate_all();
        Ok(entity)
    }

    fn delete_entity(&mut self, entity: EntityId) -> StoreResult<()> {
        self.inner.delete_entity(entity)?;
        self.invalidate_all();
        Ok(())
    }

    fn attach_component(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        value: f32,
    ) -> StoreResult<()> {
        self.inner.attach_component(entity, component, value)?;
        self.invalidate_component(component);
        Ok(())
    }

    fn attach_components(
        &mut self,
        entity: EntityId,
        components: &[ComponentId],
        values: &[f32],
    ) -> StoreResult<()> {
        self.inner.attach_components(entity, components, values)?;
        for component in components {
            self.invalidate_component(*component);
        }
        Ok(())
    }

    fn remove_component(&mut self, entity: EntityId, component: ComponentId) -> StoreResult<()> {
        self.inner.remove_component(entity, component)?;
        self.invalidate_component(component);
        Ok(())
    }

    fn set_component_batch(
        &mut self,
        entities: &[EntityId],
        component: ComponentId,
        values: &[f32],
    ) -> StoreResult<()> {
        self.inner.set_component_batch(entities, component, values)?;
        self.invalidate_component(component);
        Ok(())
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.invalidate_all();
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
        self.cached(QueryKey::new(None, components), |inner| {
            inner.entities_with_components(components)
        })
    }

    fn match_entities_with_components(
        &self,
        match_id: MatchId,
        components: &[ComponentId],
    ) -> Vec<EntityId> {
        self.cached(QueryKey::new(Some(match_id), components), |inner| {
            inner.match_entities_with_components(match_id, components)
        })
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
