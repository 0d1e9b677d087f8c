//! Test utilities for Lockstep.
//!
//! This module provides shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - Assertion macros that log expected/actual values
//!
//! # Example
//! ```
//! use lockstep::test_utils::init_test_logging;
//!
//! fn my_test() {
//!     init_test_logging();
//!     lockstep::test_phase!("setup");
//! }
//! ```

use crate::config::RuntimeConfig;
use crate::runtime::Runtime;
use std::sync::Once;
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// CPUs per node used by test runtime helpers.
pub const TEST_CPUS: usize = 2;

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Create a single-node runtime for testing.
#[must_use]
pub fn test_runtime() -> Runtime {
    init_test_logging();
    Runtime::init(&RuntimeConfig::new().cpus_per_node(TEST_CPUS))
        .expect("failed to build test runtime")
}

/// Create an in-process mesh of `nodes` runtimes for testing.
#[must_use]
pub fn test_mesh(nodes: usize) -> Vec<Runtime> {
    init_test_logging();
    Runtime::init_mesh(
        &RuntimeConfig::new()
            .node_count(nodes)
            .cpus_per_node(TEST_CPUS),
    )
    .expect("failed to build test mesh")
}

/// Shut a mesh down from its first node and wait on every node.
pub fn shutdown_mesh(runtimes: &[Runtime]) {
    if let Some(first) = runtimes.first() {
        first.shutdown();
    }
    for rt in runtimes {
        rt.wait_for_shutdown();
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
