//! Error handling for dpsup.
use std::time::Duration;

use thiserror::Error;

/// Defines all possible errors that can occur in the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A configuration value was syntactically valid YAML but semantically wrong.
    #[error("Invalid configuration for '{process}': {reason}")]
    InvalidConfig {
        /// The process (or `supervisor`) whose configuration is invalid.
        process: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// Two descriptors share the same name.
    #[error("Process '{name}' is declared more than once")]
    DuplicateProcess {
        /// The duplicated process name.
        name: String,
    },

    /// A descriptor lists itself as a dependency.
    #[error("Process '{process}' cannot depend on itself")]
    SelfDependency {
        /// The offending process.
        process: String,
    },

    /// A dependency reference is undefined in the descriptor set.
    #[error("Process '{process}' declares unknown dependency '{dependency}'")]
    UnknownDependency {
        /// The process with an invalid dependency reference.
        process: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Detected dependency cycle: {cycle}")]
    CyclicDependency {
        /// Human-readable cycle description (e.g. `a -> b -> a`).
        cycle: String,
    },

    /// The OS could not spawn the process.
    #[error("Failed to launch process '{process}': {source}")]
    LaunchFailed {
        /// The process that failed to launch.
        process: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The readiness probe did not answer in time too many times in a row.
    #[error(
        "Readiness probe for '{process}' failed {attempts} consecutive times (timeout {timeout:?})"
    )]
    ProbeTimeout {
        /// The process being probed.
        process: String,
        /// Consecutive failed attempts.
        attempts: u32,
        /// Per-attempt timeout.
        timeout: Duration,
    },

    /// An upstream dependency is permanently unavailable.
    #[error("Process '{process}' stopped because dependency '{dependency}' failed")]
    DependencyFailed {
        /// The dependent process.
        process: String,
        /// The dependency that failed.
        dependency: String,
    },

    /// Graceful termination did not complete within the grace period.
    #[error("Process '{process}' did not stop within {grace:?}; forcing termination")]
    ShutdownTimeout {
        /// The process being stopped.
        process: String,
        /// The grace period that elapsed.
        grace: Duration,
    },

    /// Signalling a process failed.
    #[error("Failed to signal process '{process}': {source}")]
    SignalError {
        /// The process that could not be signalled.
        process: String,
        /// The errno reported by the kernel.
        #[source]
        source: nix::errno::Errno,
    },

    /// A lifecycle hook was called before `init`.
    #[error("Supervisor has not been initialized")]
    NotInitialized,

    /// `after_init` was called twice.
    #[error("Supervisor has already been started")]
    AlreadyStarted,

    /// The scheduler event loop is no longer accepting events.
    #[error("Scheduler event loop is not running")]
    SchedulerUnavailable,

    /// Teardown did not reach a terminal state in time.
    #[error("Supervisor teardown did not finish within {timeout:?}")]
    TeardownTimeout {
        /// The teardown budget that elapsed.
        timeout: Duration,
    },

    /// A status snapshot could not be written.
    #[error("Failed to write status file {path}: {source}")]
    StatusWriteError {
        /// Destination of the snapshot.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SupervisorError::MutexPoisonError(err.to_string())
    }
}

impl SupervisorError {
    /// Helper for constructing a configuration error for a named process.
    pub(crate) fn invalid(process: impl Into<String>, reason: impl Into<String>) -> Self {
        SupervisorError::InvalidConfig {
            process: process.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors detected while loading descriptors, which are fatal to
    /// supervisor start-up.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            SupervisorError::ConfigReadError(_)
                | SupervisorError::ConfigParseError(_)
                | SupervisorError::InvalidConfig { .. }
                | SupervisorError::DuplicateProcess { .. }
                | SupervisorError::SelfDependency { .. }
                | SupervisorError::UnknownDependency { .. }
                | SupervisorError::CyclicDependency { .. }
        )
    }
}
