//! Entity/component storage
//!
//! [`EntityComponentStore`] is the single interface every layer implements.
//! [`ArrayStore`] is the columnar core; the other types are wrappers that
//! each own the next layer and add exactly one concern:
//!
//! - [`LockingStore`] serializes writers and shares the store between threads
//! - [`DirtyTrackingStore`] records per-match added/modified/removed sets
//! - [`QueryCacheStore`] memoizes component intersection queries
//!
//! The order of wrapping is chosen when the stack is constructed, e.g.
//! `LockingStore<DirtyTrackingStore<QueryCacheStore<ArrayStore>>>`.
//!
//! Component values are `f32`. A NaN value means "absent" and is only ever
//! tested through [`is_null`].

mod array;
mod cached;
mod dirty;
mod locking;

pub use array::ArrayStore;
pub use cached::QueryCacheStore;
pub use dirty::{DirtyInfo, DirtyTracking, DirtyTrackingStore};
pub use locking::LockingStore;

use crate::error::StoreResult;
use shared::{ComponentId, EntityId, MatchId};

/// Value stored in a slot that holds no component.
pub const NULL: f32 = f32::NAN;

/// The only place where the null sentinel is recognized.
#[inline]
pub fn is_null(value: f32) -> bool {
    value.is_nan()
}

/// Match-partitioned entity/component storage.
///
/// Reads never fail: a missing entity or component reads as [`NULL`]. Writes
/// against an entity that does not exist fail with `EntityNotFound`.
pub trait EntityComponentStore: Send + Sync {
    /// Allocates an entity tagged with `match_id` and writes its reserved
    /// `MATCH_ID`/`ENTITY_ID` components.
    fn create_entity(&mut self, match_id: MatchId) -> StoreResult<EntityId>;

    /// Clears every component of `entity` and recycles its slot. Deleting an
    /// id that is not live fails with `EntityNotFound` and changes nothing.
    fn delete_entity(&mut self, entity: EntityId) -> StoreResult<()>;

    /// Writes one component. Fails with `EntityNotFound` for a dead entity
    /// and `CapacityExceeded` for an id at or past
    /// [`component_type_count`](Self::component_type_count).
    fn attach_component(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        value: f32,
    ) -> StoreResult<()>;

    /// Attaches `components[i] = values[i]`; nothing is written unless the
    /// whole call is valid.
    fn attach_components(
        &mut self,
        entity: EntityId,
        components: &[ComponentId],
        values: &[f32],
    ) -> StoreResult<()>;

    /// Resets one component to [`NULL`]. Removing an absent component is
    /// not an error.
    fn remove_component(&mut self, entity: EntityId, component: ComponentId) -> StoreResult<()>;

    /// Writes one component across many entities. Every id is checked before
    /// anything is written.
    fn set_component_batch(
        &mut self,
        entities: &[EntityId],
        component: ComponentId,
        values: &[f32],
    ) -> StoreResult<()>;

    /// Drops every entity.
    fn reset(&mut self);

    /// Reads one component, [`NULL`] when absent.
    fn get_component(&self, entity: EntityId, component: ComponentId) -> f32;

    fn has_component(&self, entity: EntityId, component: ComponentId) -> bool {
        !is_null(self.get_component(entity, component))
    }

    /// Reads several components of one entity into `out`.
    fn get_components(
        &self,
        entity: EntityId,
        components: &[ComponentId],
        out: &mut [f32],
    ) -> StoreResult<()>;

    /// Reads one component of many entities into `out`.
    fn get_component_batch(
        &self,
        entities: &[EntityId],
        component: ComponentId,
        out: &mut [f32],
    ) -> StoreResult<()>;

    /// Entities holding every listed component, ascending and distinct.
    fn entities_with_components(&self, components: &[ComponentId]) -> Vec<EntityId>;

    /// Same as [`entities_with_components`](Self::entities_with_components),
    /// restricted to one match.
    fn match_entities_with_components(
        &self,
        match_id: MatchId,
        components: &[ComponentId],
    ) -> Vec<EntityId>;

    /// Whether `entity` is live.
    fn contains(&self, entity: EntityId) -> bool;

    /// Match a live entity belongs to.
    fn match_of(&self, entity: EntityId) -> Option<MatchId>;

    /// Number of live entities across all matches.
    fn entity_count(&self) -> usize;

    /// Capacity fixed at construction; creation beyond it fails with
    /// `CapacityExceeded`.
    fn max_entities(&self) -> usize;

    /// Upper bound on component ids accepted by writes.
    fn component_type_count(&self) -> usize;
}
