//! Constants and default values for the dpsup supervisor.
//!
//! This module centralizes the timing defaults and thresholds used when a descriptor or the
//! supervisor settings leave a value unspecified.

use std::time::Duration;

// ============================================================================
// Health Monitoring
// ============================================================================

/// Interval between readiness probes for a running process.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Per-attempt timeout applied to readiness probes.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Consecutive failed probes before a process is reported `Unhealthy`.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

// ============================================================================
// Restart Policy
// ============================================================================

/// Consecutive failures after which a process is declared permanently failed.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// First delay of the default exponential backoff.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Ceiling of the default exponential backoff.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Growth factor of the default exponential backoff.
pub const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

/// How long a process must stay `Ready` before its failure counter is cleared.
pub const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(60);

// ============================================================================
// Shutdown
// ============================================================================

/// Time a process is given to exit after `SIGTERM` before it receives `SIGKILL`.
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Upper bound on how long the teardown hook blocks.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Event Loop
// ============================================================================

/// Upper bound on how long the scheduler sleeps when no timer is pending.
pub const EVENT_LOOP_IDLE_WAIT: Duration = Duration::from_millis(500);

// ============================================================================
// Shell Execution Constants
// ============================================================================

/// Default shell used for command readiness probes.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing command strings.
pub const SHELL_COMMAND_FLAG: &str = "-c";

/// Polling step used while waiting on a probe command to finish.
pub const PROBE_COMMAND_POLL: Duration = Duration::from_millis(20);

// ============================================================================
// Status Reporting
// ============================================================================

/// Version identifier for the machine-readable status snapshot payload.
pub const STATUS_SCHEMA_VERSION: &str = "status.v1";
