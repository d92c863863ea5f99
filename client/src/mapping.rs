//! Typed views over a [`MatchMirror`]
//!
//! A [`FieldMapping`] is an explicit table, written once at startup, saying
//! which published component feeds which field of a client-side type. A
//! [`DomainRegistry`] owned by the session keeps one typed object per
//! matching entity.

use crate::mirror::MatchMirror;
use log::trace;
use shared::EntityId;
use std::collections::BTreeMap;

/// Writes one component value into a field of `T`.
pub struct FieldBinding<T> {
    pub component: String,
    pub apply: fn(&mut T, f32),
}

pub struct FieldMapping<T> {
    /// Server-side module this type mirrors.
    pub module: String,
    /// Entities carrying this component get an object.
    pub flag: String,
    pub bindings: Vec<FieldBinding<T>>,
}

impl<T> FieldMapping<T> {
    pub fn new(module: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            flag: flag.into(),
            bindings: Vec::new(),
        }
    }

    pub fn bind(mut self, component: impl Into<String>, apply: fn(&mut T, f32)) -> Self {
        self.bindings.push(FieldBinding {
            component: component.into(),
            apply,
        });
        self
    }

    /// Component names the mapping reads, flag excluded.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.component.as_str())
    }

    fn apply(&self, target: &mut T, values: &BTreeMap<String, f32>) {
        for binding in &self.bindings {
            if let Some(value) = values.get(&binding.component) {
                (binding.apply)(target, *value);
            }
        }
    }
}

/// Outcome of one [`DomainRegistry::sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    pub dropped: usize,
}

pub struct DomainRegistry<T> {
    mapping: FieldMapping<T>,
    objects: BTreeMap<EntityId, T>,
}

impl<T: Default> DomainRegistry<T> {
    pub fn new(mapping: FieldMapping<T>) -> Self {
        Self {
            mapping,
            objects: BTreeMap::new(),
        }
    }

    pub fn mapping(&self) -> &FieldMapping<T> {
        &self.mapping
    }

    /// Creates, updates and drops objects so they match the mirror.
    pub fn sync(&mut self, mirror: &MatchMirror) -> SyncSummary {
        let mut summary = SyncSummary::default();

        let before = self.objects.len();
        self.objects.retain(|id, _| {
            mirror
                .entity(*id)
                .map_or(false, |values| values.contains_key(&self.mapping.flag))
        });
        summary.dropped = before - self.objects.len();

        for (id, values) in mirror.entities() {
            if !values.contains_key(&self.mapping.flag) {
                continue;
            }
            let object = self.objects.entry(id).or_insert_with(|| {
                summary.created += 1;
                T::default()
            });
            self.mapping.apply(object, values);
        }
        summary.updated = self.objects.len() - summary.created;

        trace!(
            "Synced {} objects of {}: {:?}",
            self.objects.len(),
            self.mapping.module,
            summary
        );
        summary
    }

    pub fn get(&self, id: EntityId) -> Option<&T> {
        self.objects.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.objects.iter().map(|(id, object)| (*id, object))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
