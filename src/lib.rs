//! dpsup is a dependency-aware supervisor for sets of cooperating OS processes, such as a
//! dataplane and the control-plane agents that depend on it. Processes start in dependency
//! order gated by readiness probes, crashed processes restart with backoff until their failure
//! budget is spent, failures cascade to dependents, and shutdown runs in reverse order.

/// CLI interface.
pub mod cli;

/// Configuration loading and descriptor sources.
pub mod config;

/// Timing defaults.
pub mod constants;

/// Process descriptors and restart/readiness policies.
pub mod descriptor;

/// Error handling.
pub mod error;

/// Dependency graph and start ordering.
pub mod graph;

/// Readiness probes and health tracking.
pub mod health;

pub(crate) mod instance;

pub(crate) mod launcher;

/// Process state machine.
pub mod lifecycle;

/// Restart and backoff decisions.
pub mod restart;

pub(crate) mod scheduler;

/// Reverse-order stop planning.
pub mod shutdown;

/// Status snapshots and reporting sinks.
pub mod status;

/// Supervisor facade and host plugin lifecycle.
pub mod supervisor;

#[doc(hidden)]
pub mod test_utils;

pub use config::{DescriptorSource, StaticSource, YamlConfigSource};
pub use descriptor::{ProbeConfig, ProbeMethod, ProcessDescriptor, RestartMode, RestartPolicy};
pub use error::SupervisorError;
pub use health::{ProbeOutcome, ReadinessProbe};
pub use lifecycle::ProcessState;
pub use status::{AggregateHealth, SupervisorSnapshot};
pub use supervisor::{Plugin, Supervisor};
