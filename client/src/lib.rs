//! # Match Client Library
//!
//! This library provides a headless client for the match server. It keeps a
//! local mirror of one match up to date from the server's snapshot stream
//! and exposes the mirrored entities as typed objects.
//!
//! ## Architecture Overview
//!
//! ### Snapshot Stream
//! The server sends a full snapshot when a client subscribes or resyncs, and
//! deltas after that. A delta only applies on top of the exact tick it was
//! computed from; anything else is rejected and the client asks for a resync
//! instead of guessing.
//!
//! ### Typed Views
//! Published entities are bags of named `f32` values. A field mapping, built
//! once at startup, says which component feeds which field of a client-side
//! type, and a registry owned by the session keeps one object per entity.
//!
//! ## Module Organization
//!
//! ### Mirror Module (`mirror`)
//! Applies snapshots and deltas and answers value lookups.
//!
//! ### Mapping Module (`mapping`)
//! Field bindings and the per-session object registry.
//!
//! ### Network Module (`network`)
//! The UDP loop: connect, subscribe, follow the stream, resync when needed,
//! and optionally submit spawn commands.

pub mod mapping;
pub mod mirror;
pub mod network;
