//! Read-only status view of the supervisor.
//!
//! The scheduler publishes an immutable [`SupervisorSnapshot`] after every transition. The
//! reporter keeps the latest one for polling and pushes each one to registered sinks.
use std::{
    fs,
    path::PathBuf,
    sync::{Mutex, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{info, warn};

use crate::constants::STATUS_SCHEMA_VERSION;
use crate::error::SupervisorError;
use crate::health::HealthStatus;
use crate::lifecycle::ProcessState;

/// Health of the supervisor as a whole.
#[derive(
    Debug,
    Clone,
    Copy,
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
pub enum AggregateHealth {
    /// Every live process is `Ready`.
    Healthy,
    /// Processes are still coming up.
    Starting,
    /// Some process is `Unhealthy` or recovering from a crash.
    Degraded,
    /// Some process is permanently `Failed`.
    Down,
    /// Nothing is running.
    Stopped,
}

/// Status of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub name: String,
    pub state: ProcessState,
    pub health: HealthStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub depends_on: Vec<String>,
    pub consecutive_failures: u32,
    pub total_restarts: u32,
    pub last_exit_code: Option<i32>,
    pub last_signal: Option<i32>,
    /// Last notable condition, e.g. why the process was stopped.
    pub condition: Option<String>,
}

/// Immutable aggregate of every process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSnapshot {
    pub schema_version: String,
    pub captured_at: DateTime<Utc>,
    pub health: AggregateHealth,
    /// Processes in start order.
    pub processes: Vec<ProcessSnapshot>,
}

impl SupervisorSnapshot {
    pub fn new(processes: Vec<ProcessSnapshot>) -> Self {
        Self {
            schema_version: STATUS_SCHEMA_VERSION.to_string(),
            captured_at: Utc::now(),
            health: compute_aggregate_health(&processes),
            processes,
        }
    }

    /// Snapshot used before the scheduler has published anything.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn process(&self, name: &str) -> Option<&ProcessSnapshot> {
        self.processes.iter().find(|process| process.name == name)
    }

    /// `true` when every process is `Stopped` or `Failed`.
    pub fn all_terminal(&self) -> bool {
        self.processes.iter().all(|process| process.state.is_terminal())
    }
}

/// Folds per-process states into one aggregate: `Down` beats `Degraded` beats `Starting`.
pub fn compute_aggregate_health(processes: &[ProcessSnapshot]) -> AggregateHealth {
    let any = |predicate: fn(ProcessState) -> bool| {
        processes.iter().any(|process| predicate(process.state))
    };

    if any(|state| state == ProcessState::Failed) {
        return AggregateHealth::Down;
    }

    if any(|state| {
        matches!(
            state,
            ProcessState::Unhealthy | ProcessState::Crashed | ProcessState::Restarting
        )
    }) {
        return AggregateHealth::Degraded;
    }

    if any(|state| {
        matches!(
            state,
            ProcessState::Pending | ProcessState::Starting | ProcessState::Running
        )
    }) {
        return AggregateHealth::Starting;
    }

    if any(|state| state == ProcessState::Ready) {
        return AggregateHealth::Healthy;
    }

    // Only Stopping/Stopped left (or nothing at all).
    AggregateHealth::Stopped
}

/// Receiver of published snapshots.
pub trait StatusSink: Send {
    fn publish(&mut self, snapshot: &SupervisorSnapshot) -> Result<(), SupervisorError>;
}

/// Logs aggregate health changes.
#[derive(Debug, Default)]
pub struct TracingStatusSink {
    last: Option<AggregateHealth>,
}

impl TracingStatusSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusSink for TracingStatusSink {
    fn publish(&mut self, snapshot: &SupervisorSnapshot) -> Result<(), SupervisorError> {
        if self.last == Some(snapshot.health) {
            return Ok(());
        }

        let ready = snapshot
            .processes
            .iter()
            .filter(|process| process.state == ProcessState::Ready)
            .count();
        info!(
            health = %snapshot.health,
            ready,
            total = snapshot.processes.len(),
            "Supervisor health changed"
        );
        self.last = Some(snapshot.health);
        Ok(())
    }
}

/// Writes every snapshot to a JSON file, replacing it atomically.
#[derive(Debug)]
pub struct JsonFileStatusSink {
    path: PathBuf,
}

impl JsonFileStatusSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl JsonFileStatusSink {
    fn write(&self, snapshot: &SupervisorSnapshot) -> std::io::Result<()> {
        let payload = serde_json::to_vec_pretty(snapshot).map_err(std::io::Error::other)?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &self.path)
    }
}

impl StatusSink for JsonFileStatusSink {
    fn publish(&mut self, snapshot: &SupervisorSnapshot) -> Result<(), SupervisorError> {
        self.write(snapshot)
            .map_err(|source| SupervisorError::StatusWriteError {
                path: self.path.display().to_string(),
                source,
            })
    }
}

/// Reads a snapshot previously written by [`JsonFileStatusSink`].
pub fn load_snapshot(path: impl Into<PathBuf>) -> Result<SupervisorSnapshot, SupervisorError> {
    let path = path.into();
    let raw = fs::read_to_string(&path)?;
    serde_json::from_str(&raw).map_err(|err| {
        SupervisorError::invalid(
            "status",
            format!("{} is not a valid status file: {err}", path.display()),
        )
    })
}

/// Holds the latest snapshot and fans it out to sinks.
pub struct StatusReporter {
    latest: RwLock<SupervisorSnapshot>,
    sinks: Mutex<Vec<Box<dyn StatusSink>>>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        Self {
            latest: RwLock::new(SupervisorSnapshot::empty()),
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn add_sink(&self, sink: Box<dyn StatusSink>) -> Result<(), SupervisorError> {
        self.sinks.lock()?.push(sink);
        Ok(())
    }

    /// Copy of the latest snapshot.
    pub fn snapshot(&self) -> SupervisorSnapshot {
        match self.latest.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn publish(&self, snapshot: SupervisorSnapshot) {
        match self.latest.write() {
            Ok(mut guard) => *guard = snapshot.clone(),
            Err(poisoned) => *poisoned.into_inner() = snapshot.clone(),
        }

        let mut sinks = match self.sinks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for sink in sinks.iter_mut() {
            if let Err(err) = sink.publish(&snapshot) {
                warn!("Failed to publish status snapshot: {err}");
            }
        }
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("health", &self.snapshot().health)
            .finish()
    }
}

/// Renders `snapshot` as a plain-text table.
pub fn render_table(snapshot: &SupervisorSnapshot) -> String {
    let mut out = format!(
        "health: {}  (captured {})\n",
        snapshot.health,
        snapshot.captured_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    out.push_str(&format!(
        "{:<20} {:<11} {:<10} {:>8} {:>9} {:>8}  {}\n",
        "PROCESS", "STATE", "HEALTH", "PID", "FAILURES", "RESTARTS", "CONDITION"
    ));

    for process in &snapshot.processes {
        let pid = process
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<20} {:<11} {:<10} {:>8} {:>9} {:>8}  {}\n",
            process.name,
            process.state.as_ref(),
            process.health.as_ref(),
            pid,
            process.consecutive_failures,
            process.total_restarts,
            process.condition.as_deref().unwrap_or("")
        ));
    }
    out
}
