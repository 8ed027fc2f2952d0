//! Static declarations of the processes managed by the supervisor.
use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::constants::{
    DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX, DEFAULT_BACKOFF_MULTIPLIER,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_MAX_FAILURES, DEFAULT_PROBE_INTERVAL,
    DEFAULT_PROBE_TIMEOUT, DEFAULT_RESET_AFTER, DEFAULT_STOP_GRACE_PERIOD,
};
use crate::error::SupervisorError;

/// When a process that exited should be relaunched.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RestartMode {
    /// Relaunch after any exit, including a clean one.
    Always,
    /// Relaunch after crashes and signals; a clean exit retires the process.
    #[default]
    OnFailure,
    /// Never relaunch; the first crash is fatal.
    Never,
}

/// Delay schedule applied between consecutive restart attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every attempt.
    Fixed(Duration),
    /// Explicit, non-decreasing list of delays; the last entry repeats.
    Schedule(Vec<Duration>),
    /// `initial * multiplier^(n-1)`, capped at `max`.
    Exponential {
        /// Delay before the first restart.
        initial: Duration,
        /// Ceiling for all delays.
        max: Duration,
        /// Growth factor between attempts.
        multiplier: u32,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial: DEFAULT_BACKOFF_INITIAL,
            max: DEFAULT_BACKOFF_MAX,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl Backoff {
    /// Returns the delay to wait before restarting after the `failure`-th consecutive
    /// failure (1-based). The result never decreases as `failure` grows.
    pub fn delay(&self, failure: u32) -> Duration {
        let step = failure.max(1);
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Schedule(delays) => {
                let index = (step - 1) as usize;
                delays
                    .get(index)
                    .or_else(|| delays.last())
                    .copied()
                    .unwrap_or(Duration::ZERO)
            }
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let mut delay = *initial;
                for _ in 1..step {
                    if delay >= *max {
                        break;
                    }
                    delay = delay.saturating_mul((*multiplier).max(1));
                }
                delay.min(*max)
            }
        }
    }

    fn validate(&self, process: &str) -> Result<(), SupervisorError> {
        match self {
            Backoff::Fixed(_) => Ok(()),
            Backoff::Schedule(delays) => {
                if delays.windows(2).any(|pair| pair[1] < pair[0]) {
                    return Err(SupervisorError::invalid(
                        process,
                        "backoff schedule must be non-decreasing",
                    ));
                }
                Ok(())
            }
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                if *multiplier == 0 {
                    return Err(SupervisorError::invalid(
                        process,
                        "backoff multiplier must be at least 1",
                    ));
                }
                if max < initial {
                    return Err(SupervisorError::invalid(
                        process,
                        "backoff ceiling must not be lower than the initial delay",
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Restart policy attached to a process descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Which exits trigger a restart.
    pub mode: RestartMode,
    /// Consecutive failures that make the process permanently `Failed`. `None` retries forever.
    pub max_failures: Option<u32>,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
    /// Sustained `Ready` period that clears the consecutive-failure counter.
    pub reset_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            mode: RestartMode::default(),
            max_failures: Some(DEFAULT_MAX_FAILURES),
            backoff: Backoff::default(),
            reset_after: DEFAULT_RESET_AFTER,
        }
    }
}

/// How readiness of a running process is determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeMethod {
    /// The process exists at the OS level.
    Liveness,
    /// A file or socket path exists.
    File(PathBuf),
    /// A TCP connection to `host:port` succeeds.
    Tcp(String),
    /// An HTTP GET returns a 2xx status.
    Http(String),
    /// A shell command exits with status 0.
    Command(String),
    /// A strategy registered on the supervisor under this name.
    Custom(String),
}

impl ProbeMethod {
    /// Short identifier used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeMethod::Liveness => "liveness",
            ProbeMethod::File(_) => "file",
            ProbeMethod::Tcp(_) => "tcp",
            ProbeMethod::Http(_) => "http",
            ProbeMethod::Command(_) => "command",
            ProbeMethod::Custom(_) => "custom",
        }
    }
}

/// Readiness probe configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub method: ProbeMethod,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failures before the process is reported `Unhealthy`.
    pub failure_threshold: u32,
    /// Consecutive failures after which an `Unhealthy` process is treated as hung and killed.
    pub kill_after: Option<u32>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            method: ProbeMethod::Liveness,
            interval: DEFAULT_PROBE_INTERVAL,
            timeout: DEFAULT_PROBE_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            kill_after: None,
        }
    }
}

impl ProbeConfig {
    /// Creates a probe configuration with default timing for the given method.
    pub fn new(method: ProbeMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }
}

/// Immutable declaration of one managed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDescriptor {
    pub name: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Variables added to (or overriding) the supervisor's environment.
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Names of processes that must be `Ready` before this one launches.
    pub depends_on: Vec<String>,
    pub probe: ProbeConfig,
    pub restart: RestartPolicy,
    pub stop_grace_period: Duration,
}

impl ProcessDescriptor {
    /// Creates a descriptor with default probe, restart and stop settings.
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            depends_on: Vec::new(),
            probe: ProbeConfig::default(),
            restart: RestartPolicy::default(),
            stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
        }
    }

    /// Convenience constructor running `command` through `sh -c`.
    pub fn shell(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, "sh").with_args(["-c".to_string(), command.into()])
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    /// Checks the descriptor for values that can never work. Graph-level checks (unknown
    /// dependencies, cycles) live in [`crate::graph`].
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.name.trim().is_empty() {
            return Err(SupervisorError::invalid("<unnamed>", "process name is empty"));
        }
        if self.executable.as_os_str().is_empty() {
            return Err(SupervisorError::invalid(&self.name, "command is empty"));
        }
        if self.probe.failure_threshold == 0 {
            return Err(SupervisorError::invalid(
                &self.name,
                "readiness failure_threshold must be at least 1",
            ));
        }
        if self.probe.interval.is_zero() {
            return Err(SupervisorError::invalid(
                &self.name,
                "readiness interval must be greater than zero",
            ));
        }
        if let Some(kill_after) = self.probe.kill_after
            && kill_after < self.probe.failure_threshold
        {
            return Err(SupervisorError::invalid(
                &self.name,
                "readiness kill_after must not be lower than failure_threshold",
            ));
        }
        if self.restart.max_failures == Some(0) {
            return Err(SupervisorError::invalid(
                &self.name,
                "max_failures must be at least 1 (use mode: never to disable restarts)",
            ));
        }
        self.restart.backoff.validate(&self.name)
    }
}
