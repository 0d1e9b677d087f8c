//! Error types and error handling strategy for Lockstep.
//!
//! This module defines the core error types used throughout the runtime.
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Programmer errors (wrong-kind ids, stale handles) fail fast at the
//!   boundary where the bad handle is presented
//! - Poison is data: a poisoned generation surfaces as a typed error
//!   alongside the result query, never as a panic

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Handles and ids ===
    /// An id was decoded as a kind that does not match the accessor used.
    KindMismatch,
    /// A handle's creator-generation tag no longer matches the slot.
    StaleHandle,

    // === Barriers ===
    /// An arrival-count adjustment would invalidate an existing generation.
    ArrivalCountUnderflow,
    /// A generation's result is invalid because a contributing
    /// precondition event was poisoned.
    PoisonedGeneration,

    // === Reductions ===
    /// No reduction operator is registered under the given id.
    UnknownReduction,
    /// A reduction value's length does not match the operator's sizes.
    ReductionSizeMismatch,

    // === Tasks and processors ===
    /// No task function is registered under the given id.
    UnknownTask,
    /// A spawn targeted a processor owned by another node.
    RemoteSpawn,
    /// An operation requires the object's owner node.
    NotOwner,
    /// A task or reduction id was registered twice.
    DuplicateRegistration,

    // === Runtime lifecycle ===
    /// Unrecoverable transport error; escalated to abnormal shutdown.
    TransportFailure,
    /// The runtime is shutting down and cannot accept new work.
    ShutdownInProgress,
    /// The resolved configuration is not runnable.
    InvalidConfig,

    // === Internal / state machine ===
    /// Internal runtime error (bug).
    Internal,
}

/// The main error type for Lockstep operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error reports a poisoned generation.
    #[must_use]
    pub const fn is_poisoned(&self) -> bool {
        matches!(self.kind, ErrorKind::PoisonedGeneration)
    }

    /// Returns true if this error reports a stale handle.
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        matches!(self.kind, ErrorKind::StaleHandle)
    }

    /// Adds deterministic context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for Lockstep operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::StaleHandle);
        assert_eq!(err.to_string(), "StaleHandle");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::KindMismatch).with_context("expected a barrier id");
        assert_eq!(err.to_string(), "KindMismatch: expected a barrier id");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::TransportFailure)
            .with_context("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn predicates_match_kind() {
        assert!(Error::new(ErrorKind::PoisonedGeneration).is_poisoned());
        assert!(!Error::new(ErrorKind::PoisonedGeneration).is_stale());
        assert!(Error::new(ErrorKind::StaleHandle).is_stale());
    }

    #[test]
    fn result_ext_adds_context() {
        let res: core::result::Result<(), Error> = Err(Error::new(ErrorKind::UnknownReduction));
        let err = res.context("arrive failed").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::UnknownReduction);
        assert_eq!(err.to_string(), "UnknownReduction: arrive failed");
    }
}
