//! Core identifier types for runtime entities.

pub mod id;

pub use id::{Generation, Id, IdKind, NodeId};
