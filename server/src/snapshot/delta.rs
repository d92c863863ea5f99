//! Snapshot deltas for incremental streaming

use super::Snapshot;
use crate::store::DirtyInfo;
use shared::{DeltaMessage, EntityChange, EntityId, EntityState};
use std::collections::BTreeMap;

/// Computes the added/modified/removed triple between two snapshots of the
/// same match.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeltaCompressor;

impl DeltaCompressor {
    pub fn new() -> Self {
        DeltaCompressor
    }

    /// Compares every entity of both snapshots.
    pub fn compute(&self, from: &Snapshot, to: &Snapshot) -> DeltaMessage {
        let before = from.flatten();
        let after = to.flatten();
        let mut delta = DeltaMessage::empty(to.match_id, from.tick, to.tick);

        for (entity, values) in &after {
            match before.get(entity) {
                None => delta.added.push(EntityState {
                    id: *entity,
                    components: values.clone(),
                }),
                Some(old) => {
                    if let Some(change) = diff(*entity, old, values) {
                        delta.modified.push(change);
                    }
                }
            }
        }
        delta.removed = before
            .keys()
            .filter(|entity| !after.contains_key(entity))
            .copied()
            .collect();

        delta
    }

    /// Same result as [`compute`](Self::compute) when `changes` holds every
    /// change between the two snapshots, but only dirty entities are looked at.
    pub fn from_changes(
        &self,
        previous: &Snapshot,
        current: &Snapshot,
        changes: &DirtyInfo,
    ) -> DeltaMessage {
        let mut delta = DeltaMessage::empty(current.match_id, previous.tick, current.tick);

        for entity in &changes.removed {
            if previous.contains(*entity) {
                delta.removed.push(*entity);
            }
        }

        // added and modified are disjoint sets; merge them in id order.
        let mut touched: Vec<EntityId> = changes.touched().collect();
        touched.sort_unstable();
        for entity in touched {
            match (previous.entity_values(entity), current.entity_values(entity)) {
                (None, Some(values)) => delta.added.push(EntityState {
                    id: entity,
                    components: values,
                }),
                (Some(old), Some(new)) => {
                    if let Some(change) = diff(entity, &old, &new) {
                        delta.modified.push(change);
                    }
                }
                // Lost its last module flag.
                (Some(_), None) => delta.removed.push(entity),
                (None, None) => {}
            }
        }
        delta.removed.sort_unstable();

        delta
    }
}

fn diff(
    entity: EntityId,
    old: &BTreeMap<String, f32>,
    new: &BTreeMap<String, f32>,
) -> Option<EntityChange> {
    let components: BTreeMap<String, f32> = new
        .iter()
        .filter(|(name, value)| old.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), *value))
        .collect();
    let cleared: Vec<String> = old
        .keys()
        .filter(|name| !new.contains_key(*name))
        .cloned()
        .collect();

    if components.is_empty() && cleared.is_empty() {
        None
    } else {
        Some(EntityChange {
            id: entity,
            components,
            cleared,
        })
    }
}
