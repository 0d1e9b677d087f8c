//! Lockstep: a multi-node parallel runtime core.
//!
//! # Overview
//!
//! Lockstep is the synchronization core of a distributed task runtime:
//! per-node registries of ID-addressed objects, generational one-shot
//! events, reduction-capable generational barriers, and the
//! active-message plumbing that routes arrivals, subscriptions,
//! notifications, and shutdown between nodes.
//!
//! # Core Guarantees
//!
//! - **Stable slots**: looking an id up twice returns the same slot for
//!   the slot's lifetime; leaves are never moved or freed
//! - **Commutative arrivals**: a barrier generation's published value
//!   depends only on the multiset of contributed reduction values,
//!   never on arrival interleaving
//! - **Non-stratified phases**: arrivals for a future generation are
//!   accepted while earlier generations are still open
//! - **Monotone triggering**: once a generation triggers or publishes
//!   it stays that way; triggers and duplicate messages are idempotent
//! - **Stale-handle detection**: slot reuse bumps a creator-generation
//!   tag so handles from a destroyed object fail fast
//!
//! # Module Structure
//!
//! - [`types`]: bit-packed ids and node identifiers
//! - [`table`]: dynamic sharded tables and free lists
//! - [`node`]: the per-node registry
//! - [`event`]: generational events and merging
//! - [`barrier`]: reduction barriers
//! - [`reduction`]: reduction operator descriptors
//! - [`message`]: active-message envelopes and dispatch
//! - [`transport`]: the transport seam and in-process mesh
//! - [`proc`]: processors, spawning, machine topology
//! - [`runtime`]: the facade wiring a node together
//! - [`config`]: runtime configuration
//! - [`error`]: error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod barrier;
pub mod config;
pub mod error;
pub mod event;
pub mod index_space;
pub mod message;
pub mod node;
pub mod proc;
pub mod proc_group;
pub mod reduction;
pub mod reservation;
pub mod runtime;
pub mod table;
pub mod test_utils;
pub mod transport;
pub mod types;

// Re-exports for convenient access to core types
pub use barrier::Barrier;
pub use config::{ConfigError, RuntimeConfig};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use event::Event;
pub use index_space::IndexSpace;
pub use proc::{
    Machine, Processor, ProcessorKind, TaskContext, TaskFuncId, TASK_ID_FIRST_AVAILABLE,
};
pub use proc_group::ProcessorGroup;
pub use reduction::{ReductionOp, ReductionOpId};
pub use reservation::Reservation;
pub use runtime::{RunStyle, Runtime};
pub use types::{Generation, Id, IdKind, NodeId};
