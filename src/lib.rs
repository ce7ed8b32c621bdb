//! Conductor - command execution engine
//!
//! Runs named commands through an ordered pipeline: pluggable pre-hooks,
//! per-subject rate limiting and circuit breaking, the command handler, an
//! optimistic compare-and-swap commit with audit trail, post-hooks, and
//! finally asynchronous delivery of the events the command emitted.
//!
//! ```text
//! CommandRequest
//!     │
//!     ▼
//! Orchestrator ── registry ── hooks ── ratelimit ── handler ── store ── hooks
//!     │                                                                   │
//!     ▼                                                                   ▼
//! CommandResponse                                            queue (workers, DLQ)
//! ```
//!
//! Callers only talk to [`Orchestrator`]; everything else is wiring.

pub mod builtin;
pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod orchestrator;
pub mod queue;
pub mod ratelimit;
pub mod registry;
pub mod store;
pub mod utils;

pub use context::ExecutionContext;
pub use error::{CommandError, ErrorBody};
pub use orchestrator::{
    CommandRequest, CommandResponse, ExecutionState, Orchestrator, OrchestratorBuilder,
};
pub use registry::{CommandDefinition, CommandHandler, HandlerOutput, Mutation, StateView};
pub use store::{EntityRef, InMemoryStateStore, StateStore};
