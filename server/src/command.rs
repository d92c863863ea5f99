//! Command registration, validation and queuing
//!
//! Commands are submitted from any thread through a [`CommandSender`]. The
//! name is resolved and the payload validated at enqueue time, so callers get
//! `UnknownCommand` or payload errors in the response instead of at tick
//! time. Accepted commands wait in an unbounded FIFO until the tick loop
//! drains them; enqueueing never blocks.

use crate::error::CommandError;
use crate::registry::ComponentRegistry;
use crate::store::EntityComponentStore;
use crate::tick::TickCounter;
use log::{debug, info};
use parking_lot::RwLock;
use shared::{
    BatchReceipt, CommandPayload, CommandRequest, CommandValue, ComponentId, EntityId, MatchId,
    PlayerId, Tick,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a handler sees while it executes inside a tick.
pub struct CommandContext<'a> {
    pub store: &'a mut dyn EntityComponentStore,
    /// Tick being executed.
    pub tick: Tick,
    pub match_id: Option<MatchId>,
    pub player_id: Option<PlayerId>,
}

pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Checks the payload before the command is queued.
    fn validate(&self, _payload: &CommandPayload) -> Result<(), CommandError> {
        Ok(())
    }

    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        payload: &CommandPayload,
    ) -> Result<(), CommandError>;
}

/// Name → handler lookup shared by senders and the engine.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under its name, replacing any previous handler.
    pub fn register(&self, handler: Arc<dyn CommandHandler>) {
        let name = handler.name().to_string();
        info!("Registered command {}", name);
        self.handlers.write().insert(name, handler);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn CommandHandler>, CommandError> {
        self.handlers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CommandError::UnknownCommand {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// A validated command waiting for the tick loop.
pub struct QueuedCommand {
    pub request: CommandRequest,
    pub player_id: Option<PlayerId>,
    pub handler: Arc<dyn CommandHandler>,
}

/// Creates the two ends of a command queue.
pub fn command_queue(
    registry: Arc<CommandRegistry>,
    ticks: TickCounter,
) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        CommandSender {
            tx,
            registry,
            ticks,
            pending: Arc::clone(&pending),
        },
        CommandReceiver { rx, pending },
    )
}

#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<QueuedCommand>,
    registry: Arc<CommandRegistry>,
    ticks: TickCounter,
    pending: Arc<AtomicUsize>,
}

impl CommandSender {
    /// Validates and queues one command; returns the tick counter at enqueue.
    pub fn enqueue(
        &self,
        request: CommandRequest,
        player_id: Option<PlayerId>,
    ) -> Result<Tick, CommandError> {
        let handler = self.registry.resolve(&request.name)?;
        handler.validate(&request.payload)?;

        self.pending.fetch_add(1, Ordering::AcqRel);
        if self
            .tx
            .send(QueuedCommand {
                request,
                player_id,
                handler,
            })
            .is_err()
        {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(CommandError::ExecutionFailure(
                "tick loop has shut down".to_string(),
            ));
        }
        Ok(self.ticks.current())
    }

    /// Queues every valid command of a batch and reports the rest.
    pub fn submit_batch(
        &self,
        requests: Vec<CommandRequest>,
        player_id: Option<PlayerId>,
    ) -> BatchReceipt {
        let mut receipt = BatchReceipt {
            tick: self.ticks.current(),
            ..BatchReceipt::default()
        };

        for request in requests {
            let name = request.name.clone();
            match self.enqueue(request, player_id) {
                Ok(_) => receipt.accepted += 1,
                Err(e) => {
                    debug!("Rejected command {}: {}", name, e);
                    receipt.errors.push((name, e.to_string()));
                }
            }
        }
        receipt
    }

    /// Commands queued but not yet executed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

pub struct CommandReceiver {
    rx: mpsc::UnboundedReceiver<QueuedCommand>,
    pending: Arc<AtomicUsize>,
}

impl CommandReceiver {
    /// Next queued command, without waiting.
    pub fn try_next(&mut self) -> Option<QueuedCommand> {
        let command = self.rx.try_recv().ok()?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(command)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Built-in entity commands
// ---------------------------------------------------------------------------

const MATCH_ID_FIELD: &str = "matchId";
const ENTITY_ID_FIELD: &str = "entityId";
const COMPONENT_FIELD: &str = "component";

/// Component-valued payload entries: every key except the listed ones.
fn component_values(
    components: &ComponentRegistry,
    payload: &CommandPayload,
    skip: &[&str],
) -> Result<(Vec<ComponentId>, Vec<f32>), CommandError> {
    let mut ids = Vec::new();
    let mut values = Vec::new();
    for (key, value) in payload.iter().filter(|(key, _)| !skip.contains(key)) {
        let id = components
            .id(key)
            .ok_or_else(|| CommandError::UnknownComponent {
                name: key.to_string(),
            })?;
        let value = match value {
            CommandValue::Float(v) => *v as f32,
            CommandValue::Int(v) => *v as f32,
            CommandValue::Bool(v) => f32::from(u8::from(*v)),
            CommandValue::Text(_) => payload.float(key).map(|v| v as f32)?,
        };
        ids.push(id);
        values.push(value);
    }
    Ok((ids, values))
}

/// `spawn { matchId, <COMPONENT>: value... }`
///
/// A spawn submitted by a player and carrying no `OWNER_ID` is owned by
/// that player.
pub struct SpawnCommand {
    components: Arc<ComponentRegistry>,
}

impl SpawnCommand {
    pub fn new(components: Arc<ComponentRegistry>) -> Self {
        Self { components }
    }
}

impl CommandHandler for SpawnCommand {
    fn name(&self) -> &str {
        "spawn"
    }

    fn validate(&self, payload: &CommandPayload) -> Result<(), CommandError> {
        payload.id(MATCH_ID_FIELD)?;
        component_values(&self.components, payload, &[MATCH_ID_FIELD])?;
        Ok(())
    }

    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        payload: &CommandPayload,
    ) -> Result<(), CommandError> {
        let match_id = MatchId(payload.id(MATCH_ID_FIELD)?);
        let (mut ids, mut values) =
            component_values(&self.components, payload, &[MATCH_ID_FIELD])?;
        if let Some(player) = ctx.player_id {
            if !ids.contains(&ComponentId::OWNER_ID) {
                ids.push(ComponentId::OWNER_ID);
                values.push(player as f32);
            }
        }
        let entity = ctx.store.create_entity(match_id)?;
        ctx.store.attach_components(entity, &ids, &values)?;
        debug!("Spawned {} in {} at tick {}", entity, match_id, ctx.tick);
        Ok(())
    }
}

/// `despawn { entityId }`
pub struct DespawnCommand;

impl CommandHandler for DespawnCommand {
    fn name(&self) -> &str {
        "despawn"
    }

    fn validate(&self, payload: &CommandPayload) -> Result<(), CommandError> {
        payload.id(ENTITY_ID_FIELD)?;
        Ok(())
    }

    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        payload: &CommandPayload,
    ) -> Result<(), CommandError> {
        let entity = EntityId(payload.id(ENTITY_ID_FIELD)?);
        ctx.store.delete_entity(entity)?;
        Ok(())
    }
}

/// `attach { entityId, <COMPONENT>: value... }`
pub struct AttachCommand {
    components: Arc<ComponentRegistry>,
}

impl AttachCommand {
    pub fn new(components: Arc<ComponentRegistry>) -> Self {
        Self { components }
    }
}

impl CommandHandler for AttachCommand {
    fn name(&self) -> &str {
        "attach"
    }

    fn validate(&self, payload: &CommandPayload) -> Result<(), CommandError> {
        payload.id(ENTITY_ID_FIELD)?;
        component_values(&self.components, payload, &[ENTITY_ID_FIELD])?;
        Ok(())
    }

    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        payload: &CommandPayload,
    ) -> Result<(), CommandError> {
        let entity = EntityId(payload.id(ENTITY_ID_FIELD)?);
        let (ids, values) = component_values(&self.components, payload, &[ENTITY_ID_FIELD])?;
        ctx.store.attach_components(entity, &ids, &values)?;
        Ok(())
    }
}

/// `detach { entityId, component }`
pub struct DetachCommand {
    components: Arc<ComponentRegistry>,
}

impl DetachCommand {
    pub fn new(components: Arc<ComponentRegistry>) -> Self {
        Self { components }
    }

    fn component(&self, payload: &CommandPayload) -> Result<ComponentId, CommandError> {
        let name = payload.text(COMPONENT_FIELD)?;
        self.components
            .id(name)
            .ok_or_else(|| CommandError::UnknownComponent {
                name: name.to_string(),
            })
    }
}

impl CommandHandler for DetachCommand {
    fn name(&self) -> &str {
        "detach"
    }

    fn validate(&self, payload: &CommandPayload) -> Result<(), CommandError> {
        payload.id(ENTITY_ID_FIELD)?;
        self.component(payload)?;
        Ok(())
    }

    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        payload: &CommandPayload,
    ) -> Result<(), CommandError> {
        let entity = EntityId(payload.id(ENTITY_ID_FIELD)?);
        let component = self.component(payload)?;
        ctx.store.remove_component(entity, component)?;
        Ok(())
    }
}

/// Registers `spawn`, `despawn`, `attach` and `detach`.
pub fn register_entity_commands(registry: &CommandRegistry, components: &Arc<ComponentRegistry>) {
    registry.register(Arc::new(SpawnCommand::new(Arc::clone(components))));
    registry.register(Arc::new(DespawnCommand));
    registry.register(Arc::new(AttachCommand::new(Arc::clone(components))));
    registry.register(Arc::new(DetachCommand::new(Arc::clone(components))));
}
