//! Column-major array store

use super::{is_null, EntityComponentStore, NULL};
use crate::error::{ResourceKind, StoreError, StoreResult};
use log::trace;
use shared::{ComponentId, EntityId, MatchId};
use std::collections::{HashMap, VecDeque};

/// Columnar storage: one `Vec<f32>` per component id, indexed by a dense slot.
///
/// Public entity ids are monotonic and never handed out twice; slots are
/// recycled through a FIFO free list. Columns grow lazily, so a slot beyond a
/// column's length simply reads as null.
#[derive(Debug)]
pub struct ArrayStore {
    columns: Vec<Vec<f32>>,
    slot_of: HashMap<EntityId, u32>,
    slot_entity: Vec<Option<EntityId>>,
    slot_match: Vec<MatchId>,
    free_slots: VecDeque<u32>,
    next_id: u64,
    max_entities: usize,
    max_components: usize,
}

impl ArrayStore {
    /// Creates an empty store for up to `max_entities` live entities.
    ///
    /// `max_components` is raised to fit the reserved ids. No column memory
    /// is allocated until the first write.
    pub fn new(max_entities: usize, max_components: usize) -> Self {
        let max_components = max_components.max(ComponentId::ENTITY_ID.index() + 1);
        Self {
            columns: (0..max_components).map(|_| Vec::new()).collect(),
            slot_of: HashMap::new(),
            slot_entity: Vec::new(),
            slot_match: Vec::new(),
            free_slots: VecDeque::new(),
            next_id: 1,
            max_entities,
            max_components,
        }
    }

    /// Number of allocated slots, live or free.
    pub fn slot_capacity(&self) -> usize {
        self.slot_entity.len()
    }

    fn slot(&self, entity: EntityId) -> StoreResult<usize> {
        self.slot_of
            .get(&entity)
            .map(|slot| *slot as usize)
            .ok_or(StoreError::EntityNotFound { entity })
    }

    fn check_component(&self, component: ComponentId) -> StoreResult<()> {
        if component.index() < self.max_components {
            Ok(())
        } else {
            Err(StoreError::CapacityExceeded {
                kind: ResourceKind::Components,
                limit: self.max_components,
            })
        }
    }

    #[inline]
    fn read(&self, slot: usize, component: ComponentId) -> f32 {
        self.columns
            .get(component.index())
            .and_then(|column| column.get(slot))
            .copied()
            .unwrap_or(NULL)
    }

    #[inline]
    fn write(&mut self, slot: usize, component: ComponentId, value: f32) {
        let column = &mut self.columns[component.index()];
        if column.len() <= slot {
            if is_null(value) {
                return;
            }
            column.resize(self.slot_entity.len().max(slot + 1), NULL);
        }
        column[slot] = value;
    }

    fn allocate_slot(&mut self, entity: EntityId, match_id: MatchId) -> usize {
        match self.free_slots.pop_front() {
            Some(slot) => {
                let slot = slot as usize;
                self.slot_entity[slot] = Some(entity);
                self.slot_match[slot] = match_id;
                slot
            }
            None => {
                self.slot_entity.push(Some(entity));
                self.slot_match.push(match_id);
                self.slot_entity.len() - 1
            }
        }
    }

    fn matching_slots<'a>(
        &'a self,
        components: &'a [ComponentId],
    ) -> impl Iterator<Item = (usize, EntityId)> + 'a {
        self.slot_entity
            .iter()
            .enumerate()
            .filter_map(|(slot, entity)| entity.map(|e| (slot, e)))
            .filter(move |(slot, _)| components.iter().all(|c| !is_null(self.read(*slot, *c))))
    }
}

impl EntityComponentStore for ArrayStore {
    fn create_entity(&mut self, match_id: MatchId) -> StoreResult<EntityId> {
        if self.slot_of.len() >= self.max_entities {
            return Err(StoreError::CapacityExceeded {
                kind: ResourceKind::Entities,
                limit: self.max_entities,
            });
        }

        let entity = EntityId(self.next_id);
        self.next_id += 1;

        let slot = self.allocate_slot(entity, match_id);
        self.slot_of.insert(entity, slot as u32);
        self.write(slot, ComponentId::MATCH_ID, match_id.0 as f32);
        self.write(slot, ComponentId::ENTITY_ID, entity.0 as f32);

        trace!("Created {} in {} at slot {}", entity, match_id, slot);
        Ok(entity)
    }

    fn delete_entity(&mut self, entity: EntityId) -> StoreResult<()> {
        let slot = self.slot(entity)?;

        for column in &mut self.columns {
            if let Some(value) = column.get_mut(slot) {
                *value = NULL;
            }
        }
        self.slot_of.remove(&entity);
        self.slot_entity[slot] = None;
        self.free_slots.push_back(slot as u32);

        trace!("Deleted {} from slot {}", entity, slot);
        Ok(())
    }

    fn attach_component(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        value: f32,
    ) -> StoreResult<()> {
        let slot = self.slot(entity)?;
        self.check_component(component)?;
        self.write(slot, component, value);
        Ok(())
    }

    fn attach_components(
        &mut self,
        entity: EntityId,
        components: &[ComponentId],
        values: &[f32],
    ) -> StoreResult<()> {
        if components.len() != values.len() {
            return Err(StoreError::ParameterMismatch {
                expected: components.len(),
                actual: values.len(),
            });
        }
        let slot = self.slot(entity)?;
        for component in components {
            self.check_component(*component)?;
        }

        for (component, value) in components.iter().zip(values) {
            self.write(slot, *component, *value);
        }
        Ok(())
    }

    fn remove_component(&mut self, entity: EntityId, component: ComponentId) -> StoreResult<()> {
        let slot = self.slot(entity)?;
        self.check_component(component)?;
        self.write(slot, component, NULL);
        Ok(())
    }

    fn set_component_batch(
        &mut self,
        entities: &[EntityId],
        component: ComponentId,
        values: &[f32],
    ) -> StoreResult<()> {
        if entities.len() != values.len() {
            return Err(StoreError::ParameterMismatch {
                expected: entities.len(),
                actual: values.len(),
            });
        }
        self.check_component(component)?;
        let slots = entities
            .iter()
            .map(|entity| self.slot(*entity))
            .collect::<StoreResult<Vec<_>>>()?;

        for (slot, value) in slots.into_iter().zip(values) {
            self.write(slot, component, *value);
        }
        Ok(())
    }

    fn reset(&mut self) {
        for column in &mut self.columns {
            column.clear();
        }
        self.slot_of.clear();
        self.slot_entity.clear();
        self.slot_match.clear();
        self.free_slots.clear();
    }

    fn get_component(&self, entity: EntityId, component: ComponentId) -> f32 {
        match self.slot_of.get(&entity) {
            Some(slot) => self.read(*slot as usize, component),
            None => NULL,
        }
    }

    fn get_components(
        &self,
        entity: EntityId,
        components: &[ComponentId],
        out: &mut [f32],
    ) -> StoreResult<()> {
        if components.len() != out.len() {
            return Err(StoreError::ParameterMismatch {
                expected: components.len(),
                actual: out.len(),
            });
        }
        match self.slot_of.get(&entity) {
            Some(slot) => {
                for (component, value) in components.iter().zip(out.iter_mut()) {
                    *value = self.read(*slot as usize, *component);
                }
            }
            None => out.fill(NULL),
        }
        Ok(())
    }

    fn get_component_batch(
        &self,
        entities: &[EntityId],
        component: ComponentId,
        out: &mut [f32],
    ) -> StoreResult<()> {
        if entities.len() != out.len() {
            return Err(StoreError::ParameterMismatch {
                expected: entities.len(),
                actual: out.len(),
            });
        }
        for (entity, value) in entities.iter().zip(out.iter_mut()) {
            *value = self.get_component(*entity, component);
        }
        Ok(())
    }

    fn entities_with_components(&self, components: &[ComponentId]) -> Vec<EntityId> {
        let mut entities: Vec<EntityId> = self
            .matching_slots(components)
            .map(|(_, entity)| entity)
            .collect();
        entities.sort_unstable();
        entities
    }

    fn match_entities_with_components(
        &self,
        match_id: MatchId,
        components: &[ComponentId],
    ) -> Vec<EntityId> {
        let mut entities: Vec<EntityId> = self
            .matching_slots(components)
            .filter(|(slot, _)| self.slot_match[*slot] == match_id)
            .map(|(_, entity)| entity)
            .collect();
        entities.sort_unstable();
        entities
    }

    fn contains(&self, entity: EntityId) -> bool {
        self.slot_of.contains_key(&entity)
    }

    fn match_of(&self, entity: EntityId) -> Option<MatchId> {
        self.slot_of
            .get(&entity)
            .map(|slot| self.slot_match[*slot as usize])
    }

    fn entity_count(&self) -> usize {
        self.slot_of.len()
    }

    fn max_entities(&self) -> usize {
        self.max_entities
    }

    fn component_type_count(&self) -> usize {
        self.max_components
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const HEALTH: ComponentId = ComponentId(2);
    const ARMOR: ComponentId = ComponentId(3);

    fn store() -> ArrayStore {
        ArrayStore::new(100, 8)
    }

    #[test]
    fn test_create_writes_reserved_components() {
        let mut store = store();
        let entity = store.create_entity(MatchId(7)).unwrap();

        assert_eq!(entity, EntityId(1));
        assert_approx_eq!(store.get_component(entity, ComponentId::MATCH_ID), 7.0);
        assert_approx_eq!(store.get_component(entity, ComponentId::ENTITY_ID), 1.0);
        assert_eq!(store.match_of(entity), Some(MatchId(7)));
        assert_eq!(store.entity_count(), 1);
    }

    #[test]
    fn test_match_id_zero_is_a_real_match() {
        let mut store = store();
        let entity = store.create_entity(MatchId(0)).unwrap();
        assert_eq!(store.match_of(entity), Some(MatchId(0)));
        assert_eq!(
            store.match_entities_with_components(MatchId(0), &[]),
            vec![entity]
        );
    }

    #[test]
    fn test_large_match_ids_are_kept_exactly() {
        let mut store = store();
        let big = MatchId((1 << 40) + 1);
        let entity = store.create_entity(big).unwrap();
        assert_eq!(store.match_of(entity), Some(big));
        assert!(store
            .match_entities_with_components(MatchId(1 << 40), &[])
            .is_empty());
    }

    #[test]
    fn test_attach_get_remove() {
        let mut store = store();
        let entity = store.create_entity(MatchId(1)).unwrap();

        assert!(is_null(store.get_component(entity, HEALTH)));
        store.attach_component(entity, HEALTH, 100.0).unwrap();
        assert_approx_eq!(store.get_component(entity, HEALTH), 100.0);
        assert!(store.has_component(entity, HEALTH));

        store.remove_component(entity, HEALTH).unwrap();
        assert!(!store.has_component(entity, HEALTH));
        assert!(is_null(store.get_component(entity, HEALTH)));
    }

    #[test]
    fn test_writes_to_missing_entity_fail() {
        let mut store = store();
        let missing = EntityId(42);
        let expected = StoreError::EntityNotFound { entity: missing };

        assert_eq!(store.attach_component(missing, HEALTH, 1.0), Err(expected.clone()));
        assert_eq!(store.remove_component(missing, HEALTH), Err(expected.clone()));
        assert_eq!(store.delete_entity(missing), Err(expected));
        assert!(is_null(store.get_component(missing, HEALTH)));
    }

    #[test]
    fn test_delete_twice_reports_not_found() {
        let mut store = store();
        let entity = store.create_entity(MatchId(1)).unwrap();
        assert!(store.delete_entity(entity).is_ok());
        assert_eq!(
            store.delete_entity(entity),
            Err(StoreError::EntityNotFound { entity })
        );
        assert_eq!(store.entity_count(), 0);
    }

    #[test]
    fn test_slot_reuse_clears_values_and_issues_new_id() {
        let mut store = store();
        let first = store.create_entity(MatchId(1)).unwrap();
        store.attach_component(first, HEALTH, 10.0).unwrap();
        store.delete_entity(first).unwrap();

        let second = store.create_entity(MatchId(2)).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.slot_capacity(), 1);
        assert!(is_null(store.get_component(second, HEALTH)));
        assert!(is_null(store.get_component(first, HEALTH)));
        assert_eq!(store.match_of(second), Some(MatchId(2)));
    }

    #[test]
    fn test_free_list_is_fifo() {
        let mut store = store();
        let ids: Vec<_> = (0..3).map(|_| store.create_entity(MatchId(1)).unwrap()).collect();
        store.delete_entity(ids[2]).unwrap();
        store.delete_entity(ids[0]).unwrap();

        let a = store.create_entity(MatchId(1)).unwrap();
        store.attach_component(a, HEALTH, 1.0).unwrap();
        let b = store.create_entity(MatchId(1)).unwrap();

        // Slot 2 was freed first and is reused first.
        assert_eq!(store.slot_of[&a], 2);
        assert_eq!(store.slot_of[&b], 0);
    }

    #[test]
    fn test_capacity_boundary() {
        let mut store = ArrayStore::new(3, 8);
        let ids: Vec<_> = (0..3).map(|_| store.create_entity(MatchId(1)).unwrap()).collect();

        assert_eq!(
            store.create_entity(MatchId(1)),
            Err(StoreError::CapacityExceeded {
                kind: ResourceKind::Entities,
                limit: 3
            })
        );
        store.delete_entity(ids[1]).unwrap();
        assert!(store.create_entity(MatchId(1)).is_ok());
    }

    #[test]
    fn test_component_id_beyond_limit() {
        let mut store = ArrayStore::new(3, 4);
        let entity = store.create_entity(MatchId(1)).unwrap();
        assert!(matches!(
            store.attach_component(entity, ComponentId(4), 1.0),
            Err(StoreError::CapacityExceeded {
                kind: ResourceKind::Components,
                ..
            })
        ));
        assert!(is_null(store.get_component(entity, ComponentId(4))));
    }

    #[test]
    fn test_attach_components_validates_first() {
        let mut store = store();
        let entity = store.create_entity(MatchId(1)).unwrap();

        assert_eq!(
            store.attach_components(entity, &[HEALTH, ARMOR], &[1.0]),
            Err(StoreError::ParameterMismatch {
                expected: 2,
                actual: 1
            })
        );
        assert!(store
            .attach_components(entity, &[HEALTH, ComponentId(99)], &[1.0, 2.0])
            .is_err());
        assert!(!store.has_component(entity, HEALTH));

        store
            .attach_components(entity, &[HEALTH, ARMOR], &[5.0, 6.0])
            .unwrap();
        let mut out = [0.0; 2];
        store.get_components(entity, &[HEALTH, ARMOR], &mut out).unwrap();
        assert_eq!(out, [5.0, 6.0]);
    }

    #[test]
    fn test_batches() {
        let mut store = store();
        let a = store.create_entity(MatchId(1)).unwrap();
        let b = store.create_entity(MatchId(1)).unwrap();

        store.set_component_batch(&[a, b], HEALTH, &[1.0, 2.0]).unwrap();
        let mut out = [0.0; 3];
        store
            .get_component_batch(&[a, b, EntityId(999)], HEALTH, &mut out)
            .unwrap();
        assert_approx_eq!(out[0], 1.0);
        assert_approx_eq!(out[1], 2.0);
        assert!(is_null(out[2]));

        assert!(matches!(
            store.get_component_batch(&[a], HEALTH, &mut out),
            Err(StoreError::ParameterMismatch { .. })
        ));
        assert!(matches!(
            store.set_component_batch(&[a, b], HEALTH, &[1.0]),
            Err(StoreError::ParameterMismatch { .. })
        ));
    }

    #[test]
    fn test_set_batch_is_all_or_nothing() {
        let mut store = store();
        let a = store.create_entity(MatchId(1)).unwrap();
        let result = store.set_component_batch(&[a, EntityId(77)], HEALTH, &[3.0, 4.0]);

        assert_eq!(
            result,
            Err(StoreError::EntityNotFound {
                entity: EntityId(77)
            })
        );
        assert!(!store.has_component(a, HEALTH));
    }

    #[test]
    fn test_intersection_queries() {
        let mut store = store();
        let a = store.create_entity(MatchId(1)).unwrap();
        let b = store.create_entity(MatchId(1)).unwrap();
        let c = store.create_entity(MatchId(2)).unwrap();

        store.attach_component(a, HEALTH, 1.0).unwrap();
        store.attach_components(b, &[HEALTH, ARMOR], &[1.0, 1.0]).unwrap();
        store.attach_components(c, &[HEALTH, ARMOR], &[1.0, 1.0]).unwrap();

        assert_eq!(store.entities_with_components(&[HEALTH]), vec![a, b, c]);
        assert_eq!(store.entities_with_components(&[HEALTH, ARMOR]), vec![b, c]);
        assert_eq!(
            store.match_entities_with_components(MatchId(1), &[HEALTH, ARMOR]),
            vec![b]
        );
        assert_eq!(
            store.match_entities_with_components(MatchId(2), &[HEALTH]),
            vec![c]
        );
    }

    #[test]
    fn test_query_order_is_by_id_after_slot_reuse() {
        let mut store = store();
        let a = store.create_entity(MatchId(1)).unwrap();
        let b = store.create_entity(MatchId(1)).unwrap();
        store.delete_entity(a).unwrap();
        let c = store.create_entity(MatchId(1)).unwrap();

        // c reuses slot 0 but sorts after b.
        assert_eq!(store.entities_with_components(&[]), vec![b, c]);
    }

    #[test]
    fn test_reset() {
        let mut store = store();
        let entity = store.create_entity(MatchId(1)).unwrap();
        store.attach_component(entity, HEALTH, 1.0).unwrap();
        store.reset();

        assert_eq!(store.entity_count(), 0);
        assert!(!store.contains(entity));
        assert!(store.entities_with_components(&[HEALTH]).is_empty());
        let next = store.create_entity(MatchId(1)).unwrap();
        assert!(next.0 > entity.0);
    }
}
