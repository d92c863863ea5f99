//! Installed modules as seen by the snapshot builder
//!
//! A module contributes a flag component, which marks the entities that
//! belong to it, and the ordered list of components it publishes. The
//! snapshot pipeline only reads this information; installing and removing
//! modules belongs to whoever owns the [`ModuleRegistry`].

use log::info;
use parking_lot::RwLock;
use shared::ComponentId;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRef {
    pub id: ComponentId,
    pub name: String,
}

impl ComponentRef {
    pub fn new(id: ComponentId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub name: String,
    pub flag: ComponentRef,
    /// Published components; always starts with the flag.
    pub components: Vec<ComponentRef>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, flag: ComponentRef, components: Vec<ComponentRef>) -> Self {
        let mut published = vec![flag.clone()];
        for component in components {
            if !published.iter().any(|c| c.id == component.id) {
                published.push(component);
            }
        }
        Self {
            name: name.into(),
            flag,
            components: published,
        }
    }
}

/// Read-only view of the installed modules.
pub trait ModuleResolver: Send + Sync {
    fn module_names(&self) -> Vec<String>;

    fn resolve(&self, name: &str) -> Option<ModuleDescriptor>;

    /// Installed modules in installation order.
    fn modules(&self) -> Vec<ModuleDescriptor>;

    /// Changes whenever the installed set changes.
    fn generation(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: RwLock<Vec<ModuleDescriptor>>,
    generation: AtomicU64,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `module`, replacing an installed module of the same name.
    pub fn install(&self, module: ModuleDescriptor) {
        let mut modules = self.modules.write();
        info!(
            "Installing module {} ({} components)",
            module.name,
            module.components.len()
        );
        match modules.iter_mut().find(|m| m.name == module.name) {
            Some(existing) => *existing = module,
            None => modules.push(module),
        }
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn uninstall(&self, name: &str) -> Option<ModuleDescriptor> {
        let mut modules = self.modules.write();
        let index = modules.iter().position(|m| m.name == name)?;
        let removed = modules.remove(index);
        self.generation.fetch_add(1, Ordering::Release);
        info!("Uninstalled module {}", name);
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModuleResolver for ModuleRegistry {
    fn module_names(&self) -> Vec<String> {
        self.modules.read().iter().map(|m| m.name.clone()).collect()
    }

    fn resolve(&self, name: &str) -> Option<ModuleDescriptor> {
        self.modules.read().iter().find(|m| m.name == name).cloned()
    }

    fn modules(&self) -> Vec<ModuleDescriptor> {
        self.modules.read().clone()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combat() -> ModuleDescriptor {
        ModuleDescriptor::new(
            "combat",
            ComponentRef::new(ComponentId(2), "COMBATANT"),
            vec![
                ComponentRef::new(ComponentId(3), "HEALTH"),
                ComponentRef::new(ComponentId(2), "COMBATANT"),
            ],
        )
    }

    #[test]
    fn test_descriptor_puts_flag_first_once() {
        let module = combat();
        let names: Vec<_> = module.components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["COMBATANT", "HEALTH"]);
    }

    #[test]
    fn test_install_resolve_uninstall() {
        let registry = ModuleRegistry::new();
        assert_eq!(registry.generation(), 0);

        registry.install(combat());
        assert_eq!(registry.module_names(), vec!["combat"]);
        assert_eq!(registry.resolve("combat"), Some(combat()));
        assert!(registry.resolve("missing").is_none());
        assert_eq!(registry.generation(), 1);

        assert!(registry.uninstall("combat").is_some());
        assert!(registry.is_empty());
        assert_eq!(registry.generation(), 2);
        assert!(registry.uninstall("combat").is_none());
        assert_eq!(registry.generation(), 2);
    }

    #[test]
    fn test_reinstall_replaces_in_place() {
        let registry = ModuleRegistry::new();
        registry.install(combat());
        registry.install(ModuleDescriptor::new(
            "movement",
            ComponentRef::new(ComponentId(4), "MOVABLE"),
            vec![],
        ));
        registry.install(ModuleDescriptor::new(
            "combat",
            ComponentRef::new(ComponentId(2), "COMBATANT"),
            vec![],
        ));

        assert_eq!(registry.module_names(), vec!["combat", "movement"]);
        assert_eq!(registry.modules()[0].components.len(), 1);
        assert_eq!(registry.generation(), 3);
    }
}
