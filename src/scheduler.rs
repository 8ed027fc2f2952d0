//! Dependency scheduler and serialized event loop.
//!
//! One thread owns every [`ProcessInstance`] and consumes a single event queue. Exit watchers
//! and probe threads only send events; restart delays and stop escalations are timers kept by
//! the loop itself. Lifecycle state changes go exclusively through [`transition`].
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        mpsc::{self, RecvTimeoutError},
    },
    time::Instant,
};

use nix::sys::signal::Signal;
use tracing::{debug, error, info, warn};

use crate::constants::EVENT_LOOP_IDLE_WAIT;
use crate::descriptor::ProcessDescriptor;
use crate::error::SupervisorError;
use crate::graph::DependencyGraph;
use crate::health::{self, HealthReport, HealthStatus, ProbeRegistry, ProbeTarget};
use crate::instance::ProcessInstance;
use crate::launcher;
use crate::lifecycle::{
    Control, Effect, ExitKind, LaunchOutcome, LifecycleEvent, ProcessState, transition,
};
use crate::restart::{RestartDecision, RestartPolicyEngine};
use crate::shutdown::ShutdownCoordinator;
use crate::status::{StatusReporter, SupervisorSnapshot};

/// Messages accepted by the event loop.
#[derive(Debug)]
pub(crate) enum SchedulerEvent {
    Lifecycle {
        process: String,
        generation: u64,
        event: LifecycleEvent,
    },
    Probe {
        process: String,
        generation: u64,
        report: HealthReport,
    },
    /// Begin shutdown; `done` is signalled once every process is terminal.
    Shutdown { done: mpsc::Sender<()> },
}

#[derive(Debug)]
enum Timer {
    Restart { process: String, generation: u64 },
    ForceKill { process: String, generation: u64 },
}

/// Cloneable sender side of the event loop.
#[derive(Debug, Clone)]
pub(crate) struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    /// Requests shutdown and returns a receiver that fires once teardown is complete.
    pub fn shutdown(&self) -> Result<mpsc::Receiver<()>, SupervisorError> {
        let (done, finished) = mpsc::channel();
        self.sender
            .send(SchedulerEvent::Shutdown { done })
            .map_err(|_| SupervisorError::SchedulerUnavailable)?;
        Ok(finished)
    }
}

pub(crate) struct Scheduler {
    graph: DependencyGraph,
    instances: HashMap<String, ProcessInstance>,
    probes: ProbeRegistry,
    restart: RestartPolicyEngine,
    shutdown: ShutdownCoordinator,
    reporter: Arc<StatusReporter>,
    timers: BTreeMap<(Instant, u64), Timer>,
    timer_seq: u64,
    sender: mpsc::Sender<SchedulerEvent>,
    receiver: mpsc::Receiver<SchedulerEvent>,
    waiters: Vec<mpsc::Sender<()>>,
    dirty: bool,
}

impl Scheduler {
    /// Validates `descriptors` and builds the runtime state. Nothing is spawned until
    /// [`Scheduler::run`].
    pub fn new(
        descriptors: Vec<ProcessDescriptor>,
        probes: ProbeRegistry,
        reporter: Arc<StatusReporter>,
    ) -> Result<Self, SupervisorError> {
        for descriptor in &descriptors {
            descriptor.validate()?;
            probes.ensure_available(&descriptor.name, &descriptor.probe.method)?;
        }
        let graph = DependencyGraph::build(&descriptors)?;

        let instances = descriptors
            .into_iter()
            .map(|descriptor| {
                (
                    descriptor.name.clone(),
                    ProcessInstance::new(Arc::new(descriptor)),
                )
            })
            .collect();

        let (sender, receiver) = mpsc::channel();
        let scheduler = Self {
            graph,
            instances,
            probes,
            restart: RestartPolicyEngine::new(),
            shutdown: ShutdownCoordinator::new(),
            reporter,
            timers: BTreeMap::new(),
            timer_seq: 0,
            sender,
            receiver,
            waiters: Vec::new(),
            dirty: false,
        };
        scheduler.publish_snapshot();
        Ok(scheduler)
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            sender: self.sender.clone(),
        }
    }

    pub fn start_order(&self) -> &[String] {
        self.graph.start_order()
    }

    /// Runs the event loop until shutdown completes.
    pub fn run(mut self) {
        info!(
            "Scheduler starting {} processes in order {:?}",
            self.graph.len(),
            self.graph.start_order()
        );

        loop {
            self.launch_eligible();
            self.advance_shutdown();
            if self.dirty {
                self.publish_snapshot();
                self.dirty = false;
            }

            if self.shutdown.is_complete(&self.graph, |name| self.state_of(name)) {
                break;
            }

            match self.receiver.recv_timeout(self.next_wait()) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.fire_due_timers();
        }

        info!("All processes stopped; scheduler exiting");
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn next_wait(&self) -> std::time::Duration {
        match self.timers.keys().next() {
            Some((deadline, _)) => deadline
                .saturating_duration_since(Instant::now())
                .min(EVENT_LOOP_IDLE_WAIT),
            None => EVENT_LOOP_IDLE_WAIT,
        }
    }

    fn state_of(&self, name: &str) -> ProcessState {
        self.instances
            .get(name)
            .map(|instance| instance.state)
            .unwrap_or(ProcessState::Stopped)
    }

    fn publish_snapshot(&self) {
        let now = Instant::now();
        let processes = self
            .graph
            .start_order()
            .iter()
            .filter_map(|name| self.instances.get(name))
            .map(|instance| instance.snapshot(now))
            .collect();
        self.reporter.publish(SupervisorSnapshot::new(processes));
    }

    fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Lifecycle {
                process,
                generation,
                event,
            } => self.handle_lifecycle(&process, generation, event),
            SchedulerEvent::Probe {
                process,
                generation,
                report,
            } => self.handle_probe(&process, generation, report),
            SchedulerEvent::Shutdown { done } => {
                self.waiters.push(done);
                if self.shutdown.begin() {
                    info!("Shutdown requested; stopping processes in reverse dependency order");
                    self.timers
                        .retain(|_, timer| !matches!(timer, Timer::Restart { .. }));
                } else {
                    debug!("Shutdown already in progress");
                }
            }
        }
    }

    fn is_current(&self, name: &str, generation: u64) -> bool {
        match self.instances.get(name) {
            Some(instance) if instance.generation == generation => true,
            Some(instance) => {
                debug!(
                    "Dropping stale event for '{name}' (generation {generation}, current {})",
                    instance.generation
                );
                false
            }
            None => {
                warn!("Dropping event for unknown process '{name}'");
                false
            }
        }
    }

    fn handle_lifecycle(&mut self, name: &str, generation: u64, event: LifecycleEvent) {
        if !self.is_current(name, generation) {
            return;
        }

        match &event {
            LifecycleEvent::Launch(LaunchOutcome::Started { pid }) => {
                let stopping = match self.instances.get_mut(name) {
                    Some(instance) => {
                        instance.record_started(*pid);
                        instance.state == ProcessState::Stopping
                    }
                    None => return,
                };

                if stopping {
                    debug!("'{name}' started while stopping; terminating immediately");
                    self.terminate(name);
                } else if self.apply(name, event) == Some(ProcessState::Running) {
                    self.start_probe(name);
                }
            }
            LifecycleEvent::Launch(LaunchOutcome::Failed { reason }) => {
                if let Some(instance) = self.instances.get_mut(name) {
                    instance.condition = Some(reason.clone());
                }
                self.apply(name, event);
            }
            LifecycleEvent::Exit(kind) => {
                let kind = *kind;
                if let Some(instance) = self.instances.get_mut(name) {
                    instance.record_exit(kind);
                    if instance.state != ProcessState::Stopping && kind != ExitKind::Vanished {
                        warn!("Process '{name}' exited unexpectedly ({kind})");
                    }
                }
                self.apply(name, event);
            }
            LifecycleEvent::Health(_) | LifecycleEvent::Control(_) => {
                self.apply(name, event);
            }
        }
    }

    fn handle_probe(&mut self, name: &str, generation: u64, report: HealthReport) {
        if !self.is_current(name, generation) {
            return;
        }
        let Some(instance) = self.instances.get_mut(name) else {
            return;
        };
        if !instance.state.is_monitored() {
            return;
        }

        if instance.health != report.status {
            self.dirty = true;
        }
        instance.record_health(&report);
        let state = instance.state;
        let timeout = instance.descriptor.probe.timeout;
        let kill_after = instance.descriptor.probe.kill_after;

        match report.status {
            HealthStatus::Ready => {
                if self.apply(name, LifecycleEvent::Health(HealthStatus::Ready)).is_some()
                    && let Some(instance) = self.instances.get_mut(name)
                {
                    instance.condition = None;
                }
            }
            HealthStatus::Unhealthy => {
                if state != ProcessState::Unhealthy {
                    let err = SupervisorError::ProbeTimeout {
                        process: name.to_string(),
                        attempts: report.consecutive_failures,
                        timeout,
                    };
                    warn!("{err}");
                    if let Some(instance) = self.instances.get_mut(name) {
                        instance.condition = Some(err.to_string());
                    }
                    self.apply(name, LifecycleEvent::Health(HealthStatus::Unhealthy));
                }

                if let Some(limit) = kill_after
                    && report.consecutive_failures >= limit
                {
                    self.kill_hung(name, report.consecutive_failures);
                }
            }
            HealthStatus::Unknown | HealthStatus::Pending => {}
        }
    }

    /// Force-kills an instance that stayed unhealthy too long; its exit is handled as a crash.
    fn kill_hung(&mut self, name: &str, failures: u32) {
        let Some(instance) = self.instances.get_mut(name) else {
            return;
        };
        if instance.stop_signalled || instance.state != ProcessState::Unhealthy {
            return;
        }
        let Some(pid) = instance.pid else {
            return;
        };

        warn!("Process '{name}' (PID {pid}) failed {failures} readiness probes; killing it");
        instance.stop_signalled = true;
        instance.condition = Some(format!("killed after {failures} failed readiness probes"));
        self.dirty = true;
        if let Err(err) = launcher::signal_process(name, pid, Signal::SIGKILL) {
            error!("{err}");
        }
    }

    /// Feeds `event` through the state machine and carries out the resulting effects.
    /// Returns the new state, or `None` if the event was ignored.
    fn apply(&mut self, name: &str, event: LifecycleEvent) -> Option<ProcessState> {
        let instance = self.instances.get_mut(name)?;
        let from = instance.state;

        let Some(outcome) = transition(from, &event) else {
            debug!(
                process = name,
                state = %from,
                event = event.label(),
                "Ignoring event"
            );
            return None;
        };

        let now = Instant::now();
        let reset_after = instance.reset_after();
        instance.state = outcome.next;
        if outcome.next == ProcessState::Ready {
            instance.history.mark_ready(now);
        } else if from == ProcessState::Ready {
            instance.history.mark_not_ready(now, reset_after);
        }
        if !outcome.next.is_monitored() {
            instance.detach_probe();
        }

        info!(
            process = name,
            from = %from,
            to = %outcome.next,
            event = event.label(),
            "Lifecycle transition"
        );

        let exit = match &event {
            LifecycleEvent::Exit(kind) => Some(*kind),
            _ => None,
        };
        for effect in outcome.effects {
            match effect {
                Effect::NotifyStatus => self.dirty = true,
                Effect::RequestRestart => self.consult_restart(name, exit),
                Effect::StopDependents => self.stop_dependents(name),
            }
        }

        Some(outcome.next)
    }

    fn consult_restart(&mut self, name: &str, exit: Option<ExitKind>) {
        if self.shutdown.is_active() {
            debug!("Not restarting '{name}' during shutdown");
            self.stop_instance(name, Control::Stop);
            return;
        }

        let Some(instance) = self.instances.get_mut(name) else {
            return;
        };
        let generation = instance.generation;
        let decision = self.restart.decide(
            &instance.descriptor.restart,
            &mut instance.history,
            exit,
            Instant::now(),
        );

        match decision {
            RestartDecision::RestartNow => {
                info!("Restarting '{name}' immediately");
                instance.restart_due = true;
                self.apply(name, LifecycleEvent::Control(Control::Restart));
            }
            RestartDecision::RestartAfter(delay) => {
                info!("Restarting '{name}' in {delay:?}");
                self.apply(name, LifecycleEvent::Control(Control::Restart));
                self.schedule(
                    Instant::now() + delay,
                    Timer::Restart {
                        process: name.to_string(),
                        generation,
                    },
                );
            }
            RestartDecision::GiveUp { failures } => {
                error!("Process '{name}' failed {failures} consecutive times; giving up");
                instance.condition = Some(format!(
                    "gave up after {failures} consecutive failures"
                ));
                self.apply(name, LifecycleEvent::Control(Control::GiveUp));
            }
            RestartDecision::Retire => {
                info!("Process '{name}' exited cleanly; not restarting");
                instance.condition = Some("exited cleanly".to_string());
                self.apply(name, LifecycleEvent::Control(Control::Retire));
            }
        }
    }

    /// Moves every direct and transitive dependent of `name` to `Stopping`.
    fn stop_dependents(&mut self, name: &str) {
        let reason = match self.state_of(name) {
            ProcessState::Failed => "failed",
            _ => "is no longer running",
        };

        for dependent in self.graph.transitive_dependents(name) {
            let state = self.state_of(&dependent);
            if state.is_terminal() || state == ProcessState::Stopping {
                continue;
            }

            let err = SupervisorError::DependencyFailed {
                process: dependent.clone(),
                dependency: name.to_string(),
            };
            warn!("{err}");
            if let Some(instance) = self.instances.get_mut(&dependent) {
                instance.condition = Some(format!("dependency '{name}' {reason}"));
            }
            self.stop_instance(
                &dependent,
                Control::DependencyFailed {
                    dependency: name.to_string(),
                },
            );
        }
    }

    /// Moves `name` to `Stopping` and terminates its OS process, if any.
    fn stop_instance(&mut self, name: &str, control: Control) {
        let (from, has_pid) = match self.instances.get(name) {
            Some(instance) => (instance.state, instance.pid.is_some()),
            None => return,
        };

        if self.apply(name, LifecycleEvent::Control(control)) != Some(ProcessState::Stopping) {
            return;
        }

        if has_pid {
            self.terminate(name);
        } else if from == ProcessState::Starting {
            debug!("'{name}' is still launching; it will be stopped once started");
        } else {
            self.apply(name, LifecycleEvent::Exit(ExitKind::Vanished));
        }
    }

    /// Sends SIGTERM to the process group and arms the SIGKILL escalation timer.
    fn terminate(&mut self, name: &str) {
        let Some(instance) = self.instances.get_mut(name) else {
            return;
        };
        let Some(pid) = instance.pid else {
            return;
        };
        if instance.stop_signalled {
            return;
        }

        instance.stop_signalled = true;
        instance.detach_probe();
        let grace = instance.descriptor.stop_grace_period;
        let generation = instance.generation;

        info!("Stopping '{name}' (PID {pid}) with SIGTERM");
        match launcher::signal_process(name, pid, Signal::SIGTERM) {
            Ok(true) => {}
            Ok(false) => debug!("'{name}' (PID {pid}) already exited"),
            Err(err) => error!("{err}"),
        }

        self.schedule(
            Instant::now() + grace,
            Timer::ForceKill {
                process: name.to_string(),
                generation,
            },
        );
    }

    fn schedule(&mut self, at: Instant, timer: Timer) {
        self.timer_seq += 1;
        self.timers.insert((at, self.timer_seq), timer);
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let timer = entry.remove();
            self.fire(timer);
        }
    }

    fn fire(&mut self, timer: Timer) {
        match timer {
            Timer::Restart {
                process,
                generation,
            } => {
                if let Some(instance) = self.instances.get_mut(&process)
                    && instance.generation == generation
                    && instance.state == ProcessState::Restarting
                {
                    debug!("Restart delay for '{process}' elapsed");
                    instance.restart_due = true;
                }
            }
            Timer::ForceKill {
                process,
                generation,
            } => {
                let Some(instance) = self.instances.get(&process) else {
                    return;
                };
                if instance.generation != generation || instance.state != ProcessState::Stopping {
                    return;
                }
                let Some(pid) = instance.pid else {
                    return;
                };

                warn!(
                    "{}",
                    SupervisorError::ShutdownTimeout {
                        process: process.clone(),
                        grace: instance.descriptor.stop_grace_period,
                    }
                );
                if let Err(err) = launcher::signal_process(&process, pid, Signal::SIGKILL) {
                    error!("{err}");
                }
            }
        }
    }

    /// Launches every waiting process whose dependencies are all `Ready`.
    fn launch_eligible(&mut self) {
        if self.shutdown.is_active() {
            return;
        }

        let order = self.graph.start_order().to_vec();
        for name in order {
            let waiting = match self.instances.get(&name) {
                Some(instance) => match instance.state {
                    ProcessState::Pending => true,
                    ProcessState::Restarting => instance.restart_due,
                    _ => false,
                },
                None => false,
            };
            if !waiting {
                continue;
            }

            let dependencies_ready = self
                .graph
                .dependencies(&name)
                .iter()
                .all(|dependency| self.state_of(dependency) == ProcessState::Ready);
            if dependencies_ready {
                self.launch(&name);
            }
        }
    }

    fn launch(&mut self, name: &str) {
        if self.apply(name, LifecycleEvent::Control(Control::Start)) != Some(ProcessState::Starting)
        {
            return;
        }
        let Some(instance) = self.instances.get_mut(name) else {
            return;
        };

        let generation = instance.begin_launch();
        let descriptor = Arc::clone(&instance.descriptor);
        let sender = self.sender.clone();
        let process = name.to_string();

        let spawned = launcher::spawn_watcher(descriptor, move |event| {
            let _ = sender.send(SchedulerEvent::Lifecycle {
                process: process.clone(),
                generation,
                event,
            });
        });

        if let Err(err) = spawned {
            error!("Failed to start watcher thread for '{name}': {err}");
            let _ = self.sender.send(SchedulerEvent::Lifecycle {
                process: name.to_string(),
                generation,
                event: LifecycleEvent::Launch(LaunchOutcome::Failed {
                    reason: err.to_string(),
                }),
            });
        }
    }

    fn start_probe(&mut self, name: &str) {
        let Some(instance) = self.instances.get_mut(name) else {
            return;
        };
        let Some(pid) = instance.pid else {
            return;
        };

        let descriptor = Arc::clone(&instance.descriptor);
        let probe = match self.probes.build(
            name,
            &descriptor.probe.method,
            descriptor.working_dir.clone(),
        ) {
            Ok(probe) => probe,
            Err(err) => {
                error!("{err}");
                return;
            }
        };

        let sender = self.sender.clone();
        let process = name.to_string();
        let generation = instance.generation;
        let target = ProbeTarget {
            process: process.clone(),
            pid,
        };

        match health::spawn_probe_runner(target, descriptor.probe.clone(), probe, move |report| {
            sender
                .send(SchedulerEvent::Probe {
                    process: process.clone(),
                    generation,
                    report,
                })
                .is_ok()
        }) {
            Ok(runner) => instance.attach_probe(runner),
            Err(err) => error!("Failed to start probe thread for '{name}': {err}"),
        }
    }

    /// Issues stops for whatever the shutdown coordinator has released.
    fn advance_shutdown(&mut self) {
        loop {
            let states: HashMap<String, ProcessState> = self
                .instances
                .iter()
                .map(|(name, instance)| (name.clone(), instance.state))
                .collect();
            let batch = self.shutdown.next_stops(&self.graph, |name| {
                states.get(name).copied().unwrap_or(ProcessState::Stopped)
            });
            if batch.is_empty() {
                return;
            }
            for name in batch {
                self.stop_instance(&name, Control::Stop);
            }
        }
    }
}
