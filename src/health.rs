//! Readiness and liveness probing for running processes.
//!
//! Each monitored instance gets its own probe thread. The thread owns a [`ReadinessProbe`]
//! strategy and a [`HealthTracker`], and reports every evaluation through a callback; it never
//! touches lifecycle state directly.
use std::{
    collections::HashMap,
    fmt,
    io,
    net::{TcpStream, ToSocketAddrs},
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        Arc,
        mpsc::{self, RecvTimeoutError, TryRecvError},
    },
    thread,
    time::{Duration, Instant},
};

use nix::{errno::Errno, sys::signal, unistd::Pid};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};

use crate::constants::{DEFAULT_SHELL, PROBE_COMMAND_POLL, SHELL_COMMAND_FLAG};
use crate::descriptor::{ProbeConfig, ProbeMethod};
use crate::error::SupervisorError;

/// Health of a process as seen by its readiness probe.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthStatus {
    /// No probe has run for this instance.
    #[default]
    Unknown,
    /// Probing has started but the process has not answered successfully yet.
    Pending,
    Ready,
    Unhealthy,
}

/// Result of a single probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure(String),
    Timeout,
}

/// Identity of the process being probed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub process: String,
    pub pid: u32,
}

/// Pluggable readiness strategy.
///
/// Implementations should return within `timeout`. The runner stops waiting once `timeout`
/// elapses and records a [`ProbeOutcome::Timeout`]; an attempt that is still running when the
/// next one is due counts as another timeout.
pub trait ReadinessProbe: Send {
    fn check(&mut self, target: &ProbeTarget, timeout: Duration) -> ProbeOutcome;
}

/// Liveness by OS-level existence check.
#[derive(Debug, Default)]
pub struct LivenessProbe;

impl ReadinessProbe for LivenessProbe {
    fn check(&mut self, target: &ProbeTarget, _timeout: Duration) -> ProbeOutcome {
        match signal::kill(Pid::from_raw(target.pid as i32), None) {
            Ok(()) | Err(Errno::EPERM) => ProbeOutcome::Success,
            Err(Errno::ESRCH) => ProbeOutcome::Failure(format!("pid {} not found", target.pid)),
            Err(err) => ProbeOutcome::Failure(err.to_string()),
        }
    }
}

/// Ready once a path (file, socket, pid file) exists.
#[derive(Debug)]
pub struct FileProbe {
    path: PathBuf,
}

impl FileProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReadinessProbe for FileProbe {
    fn check(&mut self, _target: &ProbeTarget, _timeout: Duration) -> ProbeOutcome {
        if self.path.exists() {
            ProbeOutcome::Success
        } else {
            ProbeOutcome::Failure(format!("{} does not exist", self.path.display()))
        }
    }
}

/// Ready once a TCP connection can be established.
#[derive(Debug)]
pub struct TcpProbe {
    address: String,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl ReadinessProbe for TcpProbe {
    fn check(&mut self, _target: &ProbeTarget, timeout: Duration) -> ProbeOutcome {
        let addresses = match self.address.to_socket_addrs() {
            Ok(addresses) => addresses,
            Err(err) => return ProbeOutcome::Failure(format!("{}: {err}", self.address)),
        };

        let mut last_error = format!("{} did not resolve", self.address);
        for address in addresses {
            match TcpStream::connect_timeout(&address, timeout) {
                Ok(_) => return ProbeOutcome::Success,
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    return ProbeOutcome::Timeout;
                }
                Err(err) => last_error = format!("{address}: {err}"),
            }
        }
        ProbeOutcome::Failure(last_error)
    }
}

/// Ready once an HTTP GET answers with a 2xx status.
pub struct HttpProbe {
    url: String,
    client: Option<(Duration, Client)>,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: None,
        }
    }

    fn client(&mut self, timeout: Duration) -> Result<Client, reqwest::Error> {
        if let Some((cached, client)) = &self.client
            && *cached == timeout
        {
            return Ok(client.clone());
        }

        let client = Client::builder().timeout(timeout).build()?;
        self.client = Some((timeout, client.clone()));
        Ok(client)
    }
}

impl fmt::Debug for HttpProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProbe").field("url", &self.url).finish()
    }
}

impl ReadinessProbe for HttpProbe {
    fn check(&mut self, _target: &ProbeTarget, timeout: Duration) -> ProbeOutcome {
        let client = match self.client(timeout) {
            Ok(client) => client,
            Err(err) => return ProbeOutcome::Failure(err.to_string()),
        };

        let url = &self.url;
        match client.get(url).send() {
            Ok(response) if response.status().is_success() => ProbeOutcome::Success,
            Ok(response) => ProbeOutcome::Failure(format!("{url} answered {}", response.status())),
            Err(err) if err.is_timeout() => ProbeOutcome::Timeout,
            Err(err) => ProbeOutcome::Failure(err.to_string()),
        }
    }
}

/// Ready once a shell command exits with status 0. The command sees `DPSUP_PROCESS` and
/// `DPSUP_PID` in its environment.
#[derive(Debug)]
pub struct CommandProbe {
    command: String,
    working_dir: Option<PathBuf>,
}

impl CommandProbe {
    pub fn new(command: impl Into<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir,
        }
    }
}

impl ReadinessProbe for CommandProbe {
    fn check(&mut self, target: &ProbeTarget, timeout: Duration) -> ProbeOutcome {
        let mut cmd = Command::new(DEFAULT_SHELL);
        cmd.arg(SHELL_COMMAND_FLAG)
            .arg(&self.command)
            .env("DPSUP_PROCESS", &target.process)
            .env("DPSUP_PID", target.pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return ProbeOutcome::Failure(format!("failed to run probe: {err}")),
        };

        match wait_with_timeout(&mut child, timeout) {
            Ok(Some(status)) if status.success() => ProbeOutcome::Success,
            Ok(Some(status)) => ProbeOutcome::Failure(format!("probe command exited with {status}")),
            Ok(None) => {
                if let Err(err) = child.kill() {
                    debug!("Failed to kill timed-out probe for '{}': {err}", target.process);
                }
                let _ = child.wait();
                ProbeOutcome::Timeout
            }
            Err(err) => ProbeOutcome::Failure(err.to_string()),
        }
    }
}

/// Wait for a child process with a timeout, returning `Ok(None)` on timeout.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(PROBE_COMMAND_POLL);
            }
        }
    }
}

type ProbeFactory = Arc<dyn Fn() -> Box<dyn ReadinessProbe> + Send + Sync>;

/// Named custom probe strategies, consulted for [`ProbeMethod::Custom`].
#[derive(Clone, Default)]
pub struct ProbeRegistry {
    factories: HashMap<String, ProbeFactory>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory; each monitored instance gets a fresh probe from it.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ReadinessProbe> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Checks that every custom probe referenced by `method` is registered.
    pub fn ensure_available(&self, process: &str, method: &ProbeMethod) -> Result<(), SupervisorError> {
        match method {
            ProbeMethod::Custom(name) if !self.contains(name) => Err(SupervisorError::invalid(
                process,
                format!("readiness probe '{name}' is not registered"),
            )),
            _ => Ok(()),
        }
    }

    /// Instantiates the strategy for `method`.
    pub fn build(
        &self,
        process: &str,
        method: &ProbeMethod,
        working_dir: Option<PathBuf>,
    ) -> Result<Box<dyn ReadinessProbe>, SupervisorError> {
        let probe: Box<dyn ReadinessProbe> = match method {
            ProbeMethod::Liveness => Box::new(LivenessProbe),
            ProbeMethod::File(path) => Box::new(FileProbe::new(path.clone())),
            ProbeMethod::Tcp(address) => Box::new(TcpProbe::new(address.clone())),
            ProbeMethod::Http(url) => Box::new(HttpProbe::new(url.clone())),
            ProbeMethod::Command(command) => {
                Box::new(CommandProbe::new(command.clone(), working_dir))
            }
            ProbeMethod::Custom(name) => match self.factories.get(name) {
                Some(factory) => factory(),
                None => {
                    return Err(SupervisorError::invalid(
                        process,
                        format!("readiness probe '{name}' is not registered"),
                    ));
                }
            },
        };
        Ok(probe)
    }
}

impl fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ProbeRegistry").field("probes", &names).finish()
    }
}

/// One evaluation of an instance's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub outcome: ProbeOutcome,
}

/// Turns raw probe outcomes into a health status using a consecutive-failure threshold.
///
/// Health is re-evaluated on every attempt: a success after `Unhealthy` goes straight back to
/// `Ready`.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    threshold: u32,
    consecutive_failures: u32,
    status: HealthStatus,
}

impl HealthTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
            status: HealthStatus::Pending,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn record(&mut self, outcome: ProbeOutcome) -> HealthReport {
        match outcome {
            ProbeOutcome::Success => {
                self.consecutive_failures = 0;
                self.status = HealthStatus::Ready;
            }
            ProbeOutcome::Failure(_) | ProbeOutcome::Timeout => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.threshold {
                    self.status = HealthStatus::Unhealthy;
                }
            }
        }

        HealthReport {
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            outcome,
        }
    }
}

/// Handle to a running probe thread. Dropping it cancels the thread after its current attempt.
#[derive(Debug)]
pub(crate) struct ProbeRunner {
    _cancel: mpsc::Sender<()>,
}

/// Runs `check` calls for one probe on its own thread so a strategy that blocks cannot stall
/// the runner. Results come back on `results` in request order.
struct ProbeWorker {
    requests: mpsc::Sender<()>,
    results: mpsc::Receiver<ProbeOutcome>,
    in_flight: bool,
}

impl ProbeWorker {
    fn spawn(
        target: ProbeTarget,
        timeout: Duration,
        mut probe: Box<dyn ReadinessProbe>,
    ) -> io::Result<Self> {
        let (request_tx, request_rx) = mpsc::channel::<()>();
        let (result_tx, result_rx) = mpsc::channel();

        thread::Builder::new()
            .name(format!("probe-check-{}", target.process))
            .spawn(move || {
                while request_rx.recv().is_ok() {
                    if result_tx.send(probe.check(&target, timeout)).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            requests: request_tx,
            results: result_rx,
            in_flight: false,
        })
    }

    /// Runs one attempt, waiting at most `timeout`. While an earlier attempt is still running
    /// no new one is started and every call counts as another timeout.
    fn attempt(&mut self, timeout: Duration) -> ProbeOutcome {
        if self.in_flight {
            match self.results.try_recv() {
                Ok(_) => self.in_flight = false,
                Err(TryRecvError::Empty) => return ProbeOutcome::Timeout,
                Err(TryRecvError::Disconnected) => return Self::gone(),
            }
        }

        if self.requests.send(()).is_err() {
            return Self::gone();
        }

        match self.results.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                self.in_flight = true;
                ProbeOutcome::Timeout
            }
            Err(RecvTimeoutError::Disconnected) => Self::gone(),
        }
    }

    fn gone() -> ProbeOutcome {
        ProbeOutcome::Failure("probe strategy panicked".into())
    }
}

/// Starts probing `target` on a dedicated thread. The first attempt runs immediately; later
/// attempts follow `config.interval`. `report` returning `false` stops the thread.
pub(crate) fn spawn_probe_runner<F>(
    target: ProbeTarget,
    config: ProbeConfig,
    probe: Box<dyn ReadinessProbe>,
    report: F,
) -> io::Result<ProbeRunner>
where
    F: Fn(HealthReport) -> bool + Send + 'static,
{
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
    let mut worker = ProbeWorker::spawn(target.clone(), config.timeout, probe)?;

    thread::Builder::new()
        .name(format!("probe-{}", target.process))
        .spawn(move || {
            debug!(
                "Starting {} probe for '{}' (pid {})",
                config.method.kind(),
                target.process,
                target.pid
            );
            let mut tracker = HealthTracker::new(config.failure_threshold);

            loop {
                let outcome = worker.attempt(config.timeout);

                if let ProbeOutcome::Failure(reason) = &outcome {
                    debug!("Probe for '{}' failed: {reason}", target.process);
                } else if outcome == ProbeOutcome::Timeout {
                    warn!(
                        "Probe for '{}' timed out after {:?}",
                        target.process, config.timeout
                    );
                }

                if !matches!(cancel_rx.try_recv(), Err(TryRecvError::Empty)) {
                    break;
                }

                if !report(tracker.record(outcome)) {
                    break;
                }

                match cancel_rx.recv_timeout(config.interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            debug!("Probe thread for '{}' exiting", target.process);
        })?;

    Ok(ProbeRunner { _cancel: cancel_tx })
}
