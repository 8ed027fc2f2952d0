//! Runtime record of one managed process.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

use crate::descriptor::ProcessDescriptor;
use crate::health::{HealthReport, HealthStatus, ProbeRunner};
use crate::lifecycle::{ExitKind, ProcessState};
use crate::restart::FailureHistory;
use crate::status::ProcessSnapshot;

/// Mutable state the scheduler keeps per descriptor. Only the scheduler thread touches it.
#[derive(Debug)]
pub(crate) struct ProcessInstance {
    pub descriptor: Arc<ProcessDescriptor>,
    pub state: ProcessState,
    /// Incremented on every launch attempt; events tagged with an older value are stale.
    pub generation: u64,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub health: HealthStatus,
    pub history: FailureHistory,
    pub last_exit: Option<ExitKind>,
    pub condition: Option<String>,
    /// Set once a stop signal has been sent for the current generation.
    pub stop_signalled: bool,
    /// A `Restarting` instance whose backoff delay has elapsed.
    pub restart_due: bool,
    probe: Option<ProbeRunner>,
}

impl ProcessInstance {
    pub fn new(descriptor: Arc<ProcessDescriptor>) -> Self {
        Self {
            descriptor,
            state: ProcessState::Pending,
            generation: 0,
            pid: None,
            started_at: None,
            health: HealthStatus::Unknown,
            history: FailureHistory::default(),
            last_exit: None,
            condition: None,
            stop_signalled: false,
            restart_due: false,
            probe: None,
        }
    }

    /// Starts a new launch attempt and returns its generation.
    pub fn begin_launch(&mut self) -> u64 {
        self.generation += 1;
        self.pid = None;
        self.started_at = None;
        self.health = HealthStatus::Unknown;
        self.stop_signalled = false;
        self.restart_due = false;
        self.probe = None;
        self.generation
    }

    pub fn record_started(&mut self, pid: u32) {
        self.pid = Some(pid);
        self.started_at = Some(Utc::now());
    }

    /// Clears everything tied to the OS process that just went away.
    pub fn record_exit(&mut self, exit: ExitKind) {
        if exit != ExitKind::Vanished {
            self.last_exit = Some(exit);
        }
        self.pid = None;
        self.probe = None;
    }

    pub fn attach_probe(&mut self, runner: ProbeRunner) {
        self.health = HealthStatus::Pending;
        self.probe = Some(runner);
    }

    /// Stops the probe thread, if any.
    pub fn detach_probe(&mut self) {
        self.probe = None;
    }

    pub fn record_health(&mut self, report: &HealthReport) {
        self.health = report.status;
    }

    pub fn reset_after(&self) -> Duration {
        self.descriptor.restart.reset_after
    }

    pub fn snapshot(&self, now: Instant) -> ProcessSnapshot {
        ProcessSnapshot {
            name: self.descriptor.name.clone(),
            state: self.state,
            health: self.health,
            pid: self.pid,
            started_at: self.started_at,
            depends_on: self.descriptor.depends_on.clone(),
            consecutive_failures: self.history.effective_failures(now, self.reset_after()),
            total_restarts: self.history.total_restarts(),
            last_exit_code: self.last_exit.and_then(ExitKind::code),
            last_signal: self.last_exit.and_then(ExitKind::signal),
            condition: self.condition.clone(),
        }
    }
}
