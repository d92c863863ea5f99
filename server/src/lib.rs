//! # Match Server Library
//!
//! This library provides the authoritative core of a multiplayer game server.
//! It owns the canonical state of every running match, executes player
//! commands and simulation systems in fixed ticks, and turns the resulting
//! state into snapshots and deltas that can be streamed to clients.
//!
//! ## Core Responsibilities
//!
//! ### Entity/Component Storage
//! Entities are rows and component types are columns of `f32` values. Every
//! entity belongs to exactly one match; a NaN cell means "component absent".
//! The store is wrapped in layers that add locking, per-match dirty tracking
//! and memoized queries without changing its interface.
//!
//! ### Deterministic Ticks
//! Commands from any thread land in a FIFO queue. Each tick drains a bounded
//! number of them, runs the registered systems, advances the tick counter and
//! notifies listeners. A failing command or system is reported on the error
//! channel; the rest of the tick still runs.
//!
//! ### Snapshot Publication
//! After each tick the snapshots of watched matches are refreshed from the
//! dirty entities only, published to a hub readers can sample at any time,
//! and diffed against the previous publication to produce deltas.
//!
//! ## Architecture Design
//!
//! ### Single Writer
//! Only the tick loop mutates the store. Network handlers enqueue commands and
//! read published snapshots, so they never block a tick and never observe a
//! half-applied one.
//!
//! ### UDP-Based Communication
//! Clients connect, subscribe to one match and receive either a delta (when
//! they hold its base tick) or a full snapshot. Commands travel in batches and
//! are acknowledged with a receipt listing what was rejected.
//!
//! ## Module Organization
//!
//! ### Store (`store`)
//! Columnar storage and the locking, dirty-tracking and query-cache wrappers.
//!
//! ### Registries (`registry`, `module`)
//! Component names to dense ids, and the installed modules that decide what
//! a snapshot contains.
//!
//! ### Snapshots (`snapshot`, `publish`)
//! Full builds, the per-match cache, delta computation and the per-tick
//! publisher.
//!
//! ### Execution (`command`, `tick`, `engine`)
//! Command handlers and their queue, the tick loop, and the [`engine::Engine`]
//! that wires everything together.
//!
//! ### Networking (`network`, `client_manager`)
//! The UDP server loop and the per-client subscription state.

pub mod client_manager;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod module;
pub mod network;
pub mod publish;
pub mod registry;
pub mod snapshot;
pub mod store;
pub mod tick;
