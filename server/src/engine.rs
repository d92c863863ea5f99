//! Wires the store, commands, tick loop and snapshot publication together

use crate::command::{
    command_queue, register_entity_commands, CommandHandler, CommandRegistry, CommandSender,
};
use crate::config::EngineConfig;
use crate::error::StoreResult;
use crate::module::{ComponentRef, ModuleDescriptor, ModuleRegistry};
use crate::publish::{MatchUpdate, SnapshotHub, SnapshotPublisher};
use crate::registry::ComponentRegistry;
use crate::snapshot::{CachingSnapshotProvider, Snapshot, SnapshotMetrics};
use crate::store::{ArrayStore, DirtyTrackingStore, LockingStore, QueryCacheStore};
use crate::tick::{System, TickCounter, TickListener, TickLoop, TickMetrics, TickReport};
use log::info;
use shared::{ComponentId, MatchId, PlayerId, Tick, TickError};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Store chain used by the engine: array storage, memoized queries, dirty
/// tracking, then the lock.
pub type EngineStore = LockingStore<DirtyTrackingStore<QueryCacheStore<ArrayStore>>>;

pub type EngineSnapshots = CachingSnapshotProvider<QueryCacheStore<ArrayStore>>;

const ERROR_CHANNEL_CAPACITY: usize = 1024;

pub struct Engine {
    config: EngineConfig,
    store: EngineStore,
    components: Arc<ComponentRegistry>,
    modules: Arc<ModuleRegistry>,
    commands: Arc<CommandRegistry>,
    sender: CommandSender,
    snapshots: Arc<EngineSnapshots>,
    hub: SnapshotHub,
    errors: broadcast::Sender<TickError>,
    updates: Option<mpsc::UnboundedReceiver<MatchUpdate>>,
    tick_loop: TickLoop<EngineStore>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let components = Arc::new(ComponentRegistry::new(config.max_components));
        let store: EngineStore = LockingStore::new(DirtyTrackingStore::new(QueryCacheStore::new(
            ArrayStore::new(config.max_entities, config.max_components),
        )));
        let modules = Arc::new(ModuleRegistry::new());
        let commands = Arc::new(CommandRegistry::new());
        register_entity_commands(&commands, &components);

        let ticks = TickCounter::new();
        let (sender, receiver) = command_queue(Arc::clone(&commands), ticks.clone());
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        let snapshots = Arc::new(CachingSnapshotProvider::new(
            store.clone(),
            modules.clone(),
            ticks.clone(),
            config.cache.clone(),
        ));
        let hub = SnapshotHub::new();
        let (publisher, updates) = SnapshotPublisher::new(Arc::clone(&snapshots), hub.clone());

        let mut tick_loop = TickLoop::new(
            store.clone(),
            receiver,
            ticks,
            errors.clone(),
            config.max_commands_per_tick,
        );
        tick_loop.add_listener(Box::new(publisher));

        info!(
            "Engine ready: {} entities, {} component types, {} commands per tick",
            config.max_entities, config.max_components, config.max_commands_per_tick
        );

        Self {
            config,
            store,
            components,
            modules,
            commands,
            sender,
            snapshots,
            hub,
            errors,
            updates: Some(updates),
            tick_loop,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the id of component `name`, registering it if needed.
    pub fn define_component(&self, name: &str) -> StoreResult<ComponentId> {
        self.components.register(name)
    }

    pub fn components(&self) -> &Arc<ComponentRegistry> {
        &self.components
    }

    /// Installs (or replaces) a module, defining any component it names.
    pub fn install_module(&self, name: &str, flag: &str, components: &[&str]) -> StoreResult<()> {
        let flag = ComponentRef::new(self.define_component(flag)?, flag);
        let components = components
            .iter()
            .map(|component| Ok(ComponentRef::new(self.define_component(component)?, *component)))
            .collect::<StoreResult<Vec<_>>>()?;

        self.modules
            .install(ModuleDescriptor::new(name, flag, components));
        Ok(())
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    pub fn register_command(&self, handler: Arc<dyn CommandHandler>) {
        self.commands.register(handler);
    }

    pub fn add_system(&mut self, system: Box<dyn System>) {
        self.tick_loop.add_system(system);
    }

    /// Listeners run after the snapshot publisher.
    pub fn add_listener(&mut self, listener: Box<dyn TickListener>) {
        self.tick_loop.add_listener(listener);
    }

    /// Handle for submitting commands from any thread.
    pub fn commands(&self) -> CommandSender {
        self.sender.clone()
    }

    /// Published snapshots. This is how code outside the tick thread reads
    /// match state: every snapshot there belongs to a completed tick.
    pub fn hub(&self) -> SnapshotHub {
        self.hub.clone()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<TickError> {
        self.errors.subscribe()
    }

    /// Takes the receiving end of published match updates. Only the first
    /// call returns it.
    pub fn take_updates(&mut self) -> Option<mpsc::UnboundedReceiver<MatchUpdate>> {
        self.updates.take()
    }

    pub fn tick(&mut self) -> TickReport {
        self.tick_loop.advance()
    }

    pub fn current_tick(&self) -> Tick {
        self.tick_loop.current_tick()
    }

    pub fn tick_metrics(&self) -> TickMetrics {
        self.tick_loop.metrics()
    }

    /// Shared handle on the store; reads and writes lock per operation.
    pub fn store(&self) -> EngineStore {
        self.store.clone()
    }

    /// Counters of the snapshot cache. The cache itself is not exposed: it
    /// reads the live store and consumes dirty info, so only the publisher
    /// refreshes it.
    pub fn snapshot_metrics(&self) -> SnapshotMetrics {
        self.snapshots.metrics()
    }

    /// Forces the next publication of `match_id` to rebuild from scratch.
    pub fn invalidate_snapshot(&self, match_id: MatchId) {
        self.snapshots.invalidate(match_id);
    }

    /// Entities of `match_id` owned by `player`, read from the store between
    /// ticks.
    pub fn player_snapshot(&self, match_id: MatchId, player: PlayerId) -> Snapshot {
        self.snapshots.player_snapshot(match_id, player)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
