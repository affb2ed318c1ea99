#![recursion_limit = "256"]

//! state-core
//!
//! A client-side, CRDT-backed "state core" for a collaborative document
//! store: typed record/union models projected onto an embedded CRDT
//! replica ([`crdt`]), stable weak-valued reference handles ([`refs`]),
//! collection/record-level subscriptions with deep-observer fan-out
//! ([`subscription`]), independent load/live status machines
//! ([`status`]), and a transport-agnostic sync driver that publishes
//! local edits and applies remote ones with revision tracking
//! ([`sync`]). [`engine::DocumentEngine`] is the single entry point that
//! wires all of the above together per [`config::EngineConfig`].
//!
//! # Error Handling
//!
//! All fallible engine operations return [`error::StateCoreError`].
//! Transport and subscription-delivery problems are instead routed
//! through [`status`] and logged via `tracing`, per the propagation
//! policy documented on each component.

/// Error taxonomy.
pub mod error;

/// Engine configuration and its builder.
pub mod config;

/// The embedded CRDT replica wrapper.
pub mod crdt;

/// Core data-model types: document/record identity, schema shape.
pub mod model;

/// Schema registry and the record/CRDT projection layer.
pub mod schema;

/// Weak-valued document/collection/record reference caches.
pub mod refs;

/// Subscriber sets and CRDT deep-observer fan-out.
pub mod subscription;

/// Load/live status machines.
pub mod status;

/// Transport boundary and the sync driver.
pub mod sync;

/// The central orchestrator tying every component together.
pub mod engine;
