//! Supervisor facade exposing the host plugin lifecycle.
//!
//! The hosting framework drives three hooks: [`Plugin::init`] loads and validates descriptors,
//! [`Plugin::after_init`] starts the scheduler, and [`Plugin::close`] runs the reverse-order
//! shutdown and blocks until every process is terminal or the teardown budget runs out.
use std::{
    mem,
    sync::{Arc, mpsc::RecvTimeoutError},
    thread::{self, JoinHandle},
};

use tracing::{debug, error, info, warn};

use crate::config::{DescriptorSource, SupervisorSettings};
use crate::error::SupervisorError;
use crate::health::{ProbeRegistry, ReadinessProbe};
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::status::{
    JsonFileStatusSink, StatusReporter, StatusSink, SupervisorSnapshot, TracingStatusSink,
};

/// Lifecycle interface the hosting framework calls.
pub trait Plugin {
    /// Loads descriptors and builds the dependency graph. Nothing is spawned yet.
    fn init(&mut self) -> Result<(), SupervisorError>;

    /// Begins the dependency-ordered startup sequence.
    fn after_init(&mut self) -> Result<(), SupervisorError>;

    /// Stops every process in reverse dependency order. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), SupervisorError>;
}

enum Phase {
    Created,
    Initialized(Box<Scheduler>),
    Running {
        handle: SchedulerHandle,
        worker: JoinHandle<()>,
    },
    Closed,
}

/// Supervises a set of dependent OS processes.
pub struct Supervisor {
    source: Box<dyn DescriptorSource>,
    probes: ProbeRegistry,
    reporter: Arc<StatusReporter>,
    settings: SupervisorSettings,
    start_order: Vec<String>,
    phase: Phase,
}

impl Supervisor {
    /// Creates a supervisor reading its descriptors from `source`.
    pub fn new(source: impl DescriptorSource + 'static) -> Self {
        let reporter = Arc::new(StatusReporter::new());
        if let Err(err) = reporter.add_sink(Box::new(TracingStatusSink::new())) {
            warn!("Failed to register tracing status sink: {err}");
        }

        Self {
            source: Box::new(source),
            probes: ProbeRegistry::new(),
            reporter,
            settings: SupervisorSettings::default(),
            start_order: Vec::new(),
            phase: Phase::Created,
        }
    }

    /// Registers a named readiness strategy usable as `method: custom`.
    pub fn register_probe<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ReadinessProbe> + Send + Sync + 'static,
    {
        self.probes.register(name, factory);
    }

    /// Adds a receiver for every published status snapshot.
    pub fn add_status_sink(&self, sink: Box<dyn StatusSink>) -> Result<(), SupervisorError> {
        self.reporter.add_sink(sink)
    }

    /// Shared handle to the status reporter, for external status-check collaborators.
    pub fn reporter(&self) -> Arc<StatusReporter> {
        Arc::clone(&self.reporter)
    }

    /// Immutable copy of the current state of every process.
    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.reporter.snapshot()
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Start order computed by `init`; empty before that.
    pub fn start_order(&self) -> &[String] {
        &self.start_order
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running { .. })
    }
}

impl Plugin for Supervisor {
    fn init(&mut self) -> Result<(), SupervisorError> {
        if !matches!(self.phase, Phase::Created) {
            return Err(SupervisorError::AlreadyStarted);
        }

        let config = self.source.load()?;
        let scheduler = Scheduler::new(
            config.processes,
            self.probes.clone(),
            Arc::clone(&self.reporter),
        )?;

        if let Some(path) = &config.settings.status_file {
            debug!("Writing status snapshots to {}", path.display());
            let sink = JsonFileStatusSink::new(path);
            self.reporter.add_sink(Box::new(sink))?;
            self.reporter.publish(self.reporter.snapshot());
        }

        self.start_order = scheduler.start_order().to_vec();
        self.settings = config.settings;
        info!(
            "Loaded {} processes from {}; start order {:?}",
            self.start_order.len(),
            self.source.describe(),
            self.start_order
        );
        self.phase = Phase::Initialized(Box::new(scheduler));
        Ok(())
    }

    fn after_init(&mut self) -> Result<(), SupervisorError> {
        let scheduler = match mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Initialized(scheduler) => scheduler,
            Phase::Created => {
                self.phase = Phase::Created;
                return Err(SupervisorError::NotInitialized);
            }
            other => {
                self.phase = other;
                return Err(SupervisorError::AlreadyStarted);
            }
        };

        let handle = scheduler.handle();
        let worker = thread::Builder::new()
            .name("dpsup-scheduler".to_string())
            .spawn(move || scheduler.run())
            .map_err(|err| {
                error!("Failed to start scheduler thread: {err}");
                SupervisorError::SchedulerUnavailable
            })?;

        self.phase = Phase::Running { handle, worker };
        Ok(())
    }

    fn close(&mut self) -> Result<(), SupervisorError> {
        match mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Running { handle, worker } => {
                let timeout = self.settings.teardown_timeout;
                info!("Closing supervisor (teardown timeout {timeout:?})");

                let finished = handle.shutdown()?;
                match finished.recv_timeout(timeout) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        if worker.join().is_err() {
                            error!("Scheduler thread panicked during shutdown");
                        }
                        info!("All processes stopped");
                        Ok(())
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        let err = SupervisorError::TeardownTimeout { timeout };
                        error!("{err}");
                        Err(err)
                    }
                }
            }
            Phase::Initialized(_) => {
                debug!("Supervisor closed before start; nothing to stop");
                Ok(())
            }
            Phase::Created | Phase::Closed => {
                debug!("Supervisor already closed");
                Ok(())
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.is_running()
            && let Err(err) = self.close()
        {
            warn!("Supervisor teardown on drop failed: {err}");
        }
    }
}
