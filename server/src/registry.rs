//! Component name to dense identifier mapping

use crate::error::{ResourceKind, StoreError, StoreResult};
use log::debug;
use parking_lot::RwLock;
use shared::ComponentId;
use std::collections::HashMap;

pub const MATCH_ID_NAME: &str = "MATCH_ID";
pub const ENTITY_ID_NAME: &str = "ENTITY_ID";
pub const OWNER_ID_NAME: &str = "OWNER_ID";
const RESERVED_COMPONENTS: usize = 3;

#[derive(Debug, Default)]
struct Names {
    by_name: HashMap<String, ComponentId>,
    names: Vec<String>,
}

/// Hands out dense, stable component ids.
///
/// Shared between the engine, command handlers and anything that needs to
/// turn a component name into an id, so every method takes `&self`.
#[derive(Debug)]
pub struct ComponentRegistry {
    names: RwLock<Names>,
    max_components: usize,
}

impl ComponentRegistry {
    /// Creates a registry with the reserved `MATCH_ID`, `ENTITY_ID` and
    /// `OWNER_ID` entries.
    pub fn new(max_components: usize) -> Self {
        let mut names = Names::default();
        for (id, name) in [
            (ComponentId::MATCH_ID, MATCH_ID_NAME),
            (ComponentId::ENTITY_ID, ENTITY_ID_NAME),
            (ComponentId::OWNER_ID, OWNER_ID_NAME),
        ] {
            names.by_name.insert(name.to_string(), id);
            names.names.push(name.to_string());
        }

        Self {
            names: RwLock::new(names),
            max_components: max_components.max(RESERVED_COMPONENTS),
        }
    }

    /// Returns the id for `name`, registering it if needed.
    pub fn register(&self, name: &str) -> StoreResult<ComponentId> {
        if let Some(id) = self.id(name) {
            return Ok(id);
        }

        let mut names = self.names.write();
        // Lost a race with another registration of the same name.
        if let Some(id) = names.by_name.get(name) {
            return Ok(*id);
        }
        if names.names.len() >= self.max_components {
            return Err(StoreError::CapacityExceeded {
                kind: ResourceKind::Components,
                limit: self.max_components,
            });
        }

        let id = ComponentId(names.names.len() as u32);
        names.by_name.insert(name.to_string(), id);
        names.names.push(name.to_string());
        debug!("Registered component {} as {}", name, id);
        Ok(id)
    }

    pub fn id(&self, name: &str) -> Option<ComponentId> {
        self.names.read().by_name.get(name).copied()
    }

    pub fn name(&self, id: ComponentId) -> Option<String> {
        self.names.read().names.get(id.index()).cloned()
    }

    pub fn len(&self) -> usize {
        self.names.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_components(&self) -> usize {
        self.max_components
    }

    /// All registered `(id, name)` pairs in id order.
    pub fn entries(&self) -> Vec<(ComponentId, String)> {
        self.names
            .read()
            .names
            .iter()
            .enumerate()
            .map(|(i, name)| (ComponentId(i as u32), name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_components() {
        let registry = ComponentRegistry::new(10);
        assert_eq!(registry.id(MATCH_ID_NAME), Some(ComponentId::MATCH_ID));
        assert_eq!(registry.id(ENTITY_ID_NAME), Some(ComponentId::ENTITY_ID));
        assert_eq!(registry.id(OWNER_ID_NAME), Some(ComponentId::OWNER_ID));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_register_is_idempotent_and_dense() {
        let registry = ComponentRegistry::new(10);
        let health = registry.register("HEALTH").unwrap();
        let armor = registry.register("ARMOR").unwrap();

        assert_eq!(health, ComponentId(3));
        assert_eq!(armor, ComponentId(4));
        assert_eq!(registry.register("HEALTH").unwrap(), health);
        assert_eq!(registry.name(armor).as_deref(), Some("ARMOR"));
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_capacity_limit() {
        let registry = ComponentRegistry::new(4);
        registry.register("A").unwrap();
        let err = registry.register("B").unwrap_err();
        assert_eq!(
            err,
            StoreError::CapacityExceeded {
                kind: ResourceKind::Components,
                limit: 4
            }
        );
        // Existing names still resolve at capacity.
        assert!(registry.register("A").is_ok());
    }

    #[test]
    fn test_limit_never_below_reserved() {
        let registry = ComponentRegistry::new(0);
        assert_eq!(registry.max_components(), 3);
        assert!(registry.register("X").is_err());
    }

    #[test]
    fn test_entries_in_id_order() {
        let registry = ComponentRegistry::new(8);
        registry.register("SPEED").unwrap();
        let entries = registry.entries();
        assert_eq!(entries[2], (ComponentId::OWNER_ID, OWNER_ID_NAME.to_string()));
        assert_eq!(entries[3], (ComponentId(3), "SPEED".to_string()));
    }
}
