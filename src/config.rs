//! Runtime configuration and environment variable overrides.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic** — values set via the builder-style setters
//! 2. **Environment variables** — values from `LOCKSTEP_*` env vars
//! 3. **Defaults** — built-in defaults from [`RuntimeConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `LOCKSTEP_NODE_COUNT` | `usize` | `node_count` |
//! | `LOCKSTEP_CPUS` | `usize` | `cpus_per_node` |
//! | `LOCKSTEP_UTILITY_PROCS` | `usize` | `utility_procs_per_node` |
//! | `LOCKSTEP_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |

use std::time::Duration;
use thiserror::Error;

/// Environment variable name for the node count.
pub const ENV_NODE_COUNT: &str = "LOCKSTEP_NODE_COUNT";
/// Environment variable name for CPUs per node.
pub const ENV_CPUS: &str = "LOCKSTEP_CPUS";
/// Environment variable name for utility processors per node.
pub const ENV_UTILITY_PROCS: &str = "LOCKSTEP_UTILITY_PROCS";
/// Environment variable name for the worker thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "LOCKSTEP_THREAD_NAME_PREFIX";

/// Errors produced while resolving a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held an unparseable value.
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnvValue {
        /// The offending variable.
        var: &'static str,
        /// The raw value found.
        value: String,
    },

    /// The resolved configuration is not runnable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for a runtime instance (or an in-process mesh of
/// them).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of nodes wired together by `init_mesh`.
    pub node_count: usize,
    /// CPU processors hosted by each node.
    pub cpus_per_node: usize,
    /// Utility processors hosted by each node.
    pub utility_procs_per_node: usize,
    /// Prefix for worker and poller thread names.
    pub thread_name_prefix: String,
    /// How long the message poller sleeps between inbox checks.
    pub poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_count: 1,
            cpus_per_node: 2,
            utility_procs_per_node: 0,
            thread_name_prefix: "lockstep".to_string(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl RuntimeConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of nodes.
    #[must_use]
    pub fn node_count(mut self, nodes: usize) -> Self {
        self.node_count = nodes;
        self
    }

    /// Sets the CPU processors per node.
    #[must_use]
    pub fn cpus_per_node(mut self, cpus: usize) -> Self {
        self.cpus_per_node = cpus;
        self
    }

    /// Sets the utility processors per node.
    #[must_use]
    pub fn utility_procs_per_node(mut self, procs: usize) -> Self {
        self.utility_procs_per_node = procs;
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Checks that the configuration is runnable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_count == 0 {
            return Err(ConfigError::Invalid("node_count must be at least 1".into()));
        }
        if self.node_count > usize::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "node_count {} exceeds the id owner field",
                self.node_count
            )));
        }
        if self.cpus_per_node == 0 {
            return Err(ConfigError::Invalid(
                "cpus_per_node must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Applies `LOCKSTEP_*` environment overrides to a configuration.
///
/// Only variables that are set are applied. Returns an error if a
/// variable is set but unparseable.
pub fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_NODE_COUNT) {
        config.node_count = parse_usize(ENV_NODE_COUNT, &val)?;
    }
    if let Some(val) = read_env(ENV_CPUS) {
        config.cpus_per_node = parse_usize(ENV_CPUS, &val)?;
    }
    if let Some(val) = read_env(ENV_UTILITY_PROCS) {
        config.utility_procs_per_node = parse_usize(ENV_UTILITY_PROCS, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    Ok(())
}

fn read_env(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn parse_usize(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnvValue {
        var,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        RuntimeConfig::default().validate().expect("default config invalid");
    }

    #[test]
    fn zero_nodes_rejected() {
        let err = RuntimeConfig::default()
            .node_count(0)
            .validate()
            .expect_err("expected err");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_cpus_rejected() {
        let err = RuntimeConfig::default()
            .cpus_per_node(0)
            .validate()
            .expect_err("expected err");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn builder_setters_apply() {
        let config = RuntimeConfig::new()
            .node_count(3)
            .cpus_per_node(4)
            .utility_procs_per_node(1)
            .thread_name_prefix("mesh");
        assert_eq!(config.node_count, 3);
        assert_eq!(config.cpus_per_node, 4);
        assert_eq!(config.utility_procs_per_node, 1);
        assert_eq!(config.thread_name_prefix, "mesh");
    }

    #[test]
    fn parse_usize_rejects_garbage() {
        let err = parse_usize(ENV_CPUS, "four").expect_err("expected err");
        assert!(matches!(err, ConfigError::InvalidEnvValue { var, .. } if var == ENV_CPUS));
    }
}
