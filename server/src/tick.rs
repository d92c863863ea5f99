//! The single-writer tick loop
//!
//! One tick:
//! 1. executes up to `max_commands_per_tick` queued commands in FIFO order
//! 2. runs every registered system once, in registration order
//! 3. advances the tick counter
//! 4. notifies tick listeners in registration order
//!
//! A command or system that fails, or panics, is reported on the tick-error
//! channel and the rest of the tick carries on.

use crate::command::{CommandContext, CommandReceiver, QueuedCommand};
use crate::error::CommandError;
use crate::store::EntityComponentStore;
use log::{debug, error, warn};
use serde::Serialize;
use shared::{MatchId, Tick, TickError};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

/// Shared count of completed ticks.
#[derive(Debug, Clone, Default)]
pub struct TickCounter(Arc<AtomicU64>);

impl TickCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Tick {
        self.0.load(Ordering::Acquire)
    }

    /// Marks one more tick as complete and returns its number.
    pub fn advance(&self) -> Tick {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

pub struct SystemContext<'a> {
    pub store: &'a mut dyn EntityComponentStore,
    /// Tick being executed.
    pub tick: Tick,
}

pub trait System: Send + Sync {
    fn name(&self) -> &str;

    fn run(&mut self, ctx: &mut SystemContext<'_>) -> Result<(), CommandError>;
}

/// Called on the tick thread after each tick. Implementations hand work off
/// and return quickly.
pub trait TickListener: Send + Sync {
    fn on_tick_complete(&mut self, tick: Tick);
}

/// Forwards completed tick numbers to an async consumer.
pub struct ChannelTickListener {
    tx: mpsc::UnboundedSender<Tick>,
}

impl ChannelTickListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Tick>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TickListener for ChannelTickListener {
    fn on_tick_complete(&mut self, tick: Tick) {
        if self.tx.send(tick).is_err() {
            debug!("Tick {} not forwarded, receiver dropped", tick);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: Tick,
    pub commands_executed: usize,
    pub commands_failed: usize,
    /// Commands left queued for later ticks.
    pub commands_deferred: usize,
    pub systems_run: usize,
    pub systems_failed: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TickMetrics {
    pub total_ticks: u64,
    pub last_ms: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl TickMetrics {
    fn record(&mut self, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        self.total_ticks += 1;
        self.last_ms = ms;
        self.avg_ms += (ms - self.avg_ms) / self.total_ticks as f64;
        self.min_ms = if self.total_ticks == 1 {
            ms
        } else {
            self.min_ms.min(ms)
        };
        self.max_ms = self.max_ms.max(ms);
    }
}

pub struct TickLoop<S> {
    store: S,
    commands: CommandReceiver,
    systems: Vec<Box<dyn System>>,
    listeners: Vec<Box<dyn TickListener>>,
    errors: broadcast::Sender<TickError>,
    ticks: TickCounter,
    max_commands_per_tick: usize,
    metrics: TickMetrics,
}

impl<S: EntityComponentStore> TickLoop<S> {
    /// Creates a loop draining `commands` into `store`.
    ///
    /// `max_commands_per_tick` is raised to 1 if smaller, so queued commands
    /// always make progress.
    pub fn new(
        store: S,
        commands: CommandReceiver,
        ticks: TickCounter,
        errors: broadcast::Sender<TickError>,
        max_commands_per_tick: usize,
    ) -> Self {
        Self {
            store,
            commands,
            systems: Vec::new(),
            listeners: Vec::new(),
            errors,
            ticks,
            max_commands_per_tick: max_commands_per_tick.max(1),
            metrics: TickMetrics::default(),
        }
    }

    pub fn add_system(&mut self, system: Box<dyn System>) {
        self.systems.push(system);
    }

    pub fn add_listener(&mut self, listener: Box<dyn TickListener>) {
        self.listeners.push(listener);
    }

    pub fn current_tick(&self) -> Tick {
        self.ticks.current()
    }

    pub fn metrics(&self) -> TickMetrics {
        self.metrics
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one tick.
    pub fn advance(&mut self) -> TickReport {
        let started = Instant::now();
        let tick = self.ticks.current() + 1;
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };

        while report.commands_executed + report.commands_failed < self.max_commands_per_tick {
            let Some(command) = self.commands.try_next() else {
                break;
            };
            match self.execute_command(tick, &command) {
                Ok(()) => report.commands_executed += 1,
                Err(message) => {
                    report.commands_failed += 1;
                    self.report(TickError {
                        tick,
                        match_id: command_match(&command),
                        player_id: command.player_id,
                        source: command.request.name.clone(),
                        message,
                    });
                }
            }
        }
        report.commands_deferred = self.commands.pending();
        if report.commands_deferred > 0 {
            debug!(
                "Tick {}: {} commands deferred",
                tick, report.commands_deferred
            );
        }

        for index in 0..self.systems.len() {
            let result = {
                let system = &mut self.systems[index];
                let mut ctx = SystemContext {
                    store: &mut self.store,
                    tick,
                };
                catch_unwind(AssertUnwindSafe(|| system.run(&mut ctx)))
            };
            report.systems_run += 1;

            let message = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            report.systems_failed += 1;
            let source = self.systems[index].name().to_string();
            self.report(TickError {
                tick,
                match_id: None,
                player_id: None,
                source,
                message,
            });
        }

        let completed = self.ticks.advance();
        report.duration = started.elapsed();
        self.metrics.record(report.duration);

        for listener in &mut self.listeners {
            listener.on_tick_complete(completed);
        }
        report
    }

    fn execute_command(&mut self, tick: Tick, command: &QueuedCommand) -> Result<(), String> {
        let mut ctx = CommandContext {
            store: &mut self.store,
            tick,
            match_id: command.request.match_id,
            player_id: command.player_id,
        };
        let handler = &command.handler;
        let payload = &command.request.payload;

        match catch_unwind(AssertUnwindSafe(|| handler.execute(&mut ctx, payload))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(panic_message(panic.as_ref())),
        }
    }

    fn report(&self, failure: TickError) {
        error!(
            "Tick {}: {} failed: {}",
            failure.tick, failure.source, failure.message
        );
        if self.errors.send(failure).is_err() {
            warn!("No tick-error subscribers");
        }
    }
}

fn command_match(command: &QueuedCommand) -> Option<MatchId> {
    command.request.match_id.or_else(|| {
        command
            .request
            .payload
            .id("matchId")
            .ok()
            .map(MatchId)
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
