//! ```text
//! WorkflowSpec ─► GraphBuilder::compile ─► Graph
//!                                           │
//!            Engine::start ────────────────►│
//!                │                          ▼
//!                ├─► RunDriver (lease) ─► step loop ─► policy Oracle
//!                │        │                   │            │
//!                │        │                   ├─► Task/Agent/Terminal behavior
//!                │        │                   └─► Human checkpoint (resume)
//!                │        ▼
//!                │   EventStore.append ──► events + outbox (one tx)
//!                │        │                      │
//!                │        ├─► RunState reducer   └─► OutboxPublisher ─► EventBus
//!                │        └─► Snapshot every k                │
//!                │                                            └─► DLQ on exhaustion
//!                └─► DecisionRecorder ─► DecisionSink (audit)
//! ```
//!
//! Gantry is a durable, event-sourced workflow engine for directed acyclic
//! graphs whose edges are gated by an external policy oracle and whose
//! vertices are deterministic tasks, agent invocations, or human approval
//! checkpoints. Runs survive process restarts (snapshot + replay through a
//! pure reducer), resume on external input, emit one decision record per
//! node invocation, and deliver every event downstream at least once
//! through a transactional outbox.
//!
//! Storage, bus, policy, lease, audit, and agent backends are adapter
//! traits; in-memory implementations of each ship with the crate, and a
//! SQLite store is available behind the `sqlite` feature.

pub mod audit;
pub mod bus;
pub mod context;
pub mod dlq;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod graphs;
pub mod lease;
pub mod outbox;
pub mod policy;
pub mod spec;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;
