//! Per-process lifecycle state machine.
//!
//! [`transition`] is a pure function of the current state and an incoming event. It never
//! performs I/O: the scheduler applies the returned state and acts on the returned effects.
//! Events that make no sense in the current state yield `None` and are dropped by the caller.
use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::health::HealthStatus;

/// Lifecycle state of a process instance.
#[derive(
    Debug,
    Clone,
    Copy,
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
pub enum ProcessState {
    Pending,
    Starting,
    Running,
    Ready,
    Unhealthy,
    Stopping,
    Stopped,
    Crashed,
    Restarting,
    Failed,
}

impl ProcessState {
    /// `Stopped` and `Failed` never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }

    /// States in which an OS process exists (or is being spawned).
    pub fn has_process(self) -> bool {
        matches!(
            self,
            ProcessState::Starting
                | ProcessState::Running
                | ProcessState::Ready
                | ProcessState::Unhealthy
                | ProcessState::Stopping
        )
    }

    /// States in which the readiness probe should be running.
    pub fn is_monitored(self) -> bool {
        matches!(
            self,
            ProcessState::Running | ProcessState::Ready | ProcessState::Unhealthy
        )
    }
}

/// Result of an OS-level spawn attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Started { pid: u32 },
    Failed { reason: String },
}

/// How a process left the running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    /// Normal exit with the given status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
    /// There was no OS process to wait for (never launched, or already reaped).
    Vanished,
}

impl ExitKind {
    /// A zero exit status.
    pub fn is_clean(self) -> bool {
        matches!(self, ExitKind::Exited(0))
    }

    pub fn code(self) -> Option<i32> {
        match self {
            ExitKind::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn signal(self) -> Option<i32> {
        match self {
            ExitKind::Signaled(signal) => Some(signal),
            _ => None,
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Exited(code) => write!(f, "exit code {code}"),
            ExitKind::Signaled(signal) => write!(f, "signal {signal}"),
            ExitKind::Vanished => f.write_str("no process"),
        }
    }
}

/// Decisions and requests issued by the scheduler, routed through the state machine so that
/// it stays the only writer of lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Launch (or relaunch) the process.
    Start,
    /// Stop the process as part of a supervisor shutdown.
    Stop,
    /// An upstream dependency became permanently unavailable.
    DependencyFailed { dependency: String },
    /// The restart policy scheduled another attempt.
    Restart,
    /// The restart policy exhausted its budget.
    GiveUp,
    /// The process exited cleanly and its policy does not restart clean exits.
    Retire,
}

/// Everything that can drive a lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Launch(LaunchOutcome),
    Health(HealthStatus),
    Exit(ExitKind),
    Control(Control),
}

impl LifecycleEvent {
    /// Short label used in structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            LifecycleEvent::Launch(LaunchOutcome::Started { .. }) => "launch_started",
            LifecycleEvent::Launch(LaunchOutcome::Failed { .. }) => "launch_failed",
            LifecycleEvent::Health(_) => "health",
            LifecycleEvent::Exit(_) => "exit",
            LifecycleEvent::Control(Control::Start) => "start",
            LifecycleEvent::Control(Control::Stop) => "stop",
            LifecycleEvent::Control(Control::DependencyFailed { .. }) => "dependency_failed",
            LifecycleEvent::Control(Control::Restart) => "restart",
            LifecycleEvent::Control(Control::GiveUp) => "give_up",
            LifecycleEvent::Control(Control::Retire) => "retire",
        }
    }
}

/// Side effects a transition asks the scheduler to carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Ask the restart policy what to do about a failure.
    RequestRestart,
    /// Publish a fresh status snapshot.
    NotifyStatus,
    /// Stop every direct and transitive dependent.
    StopDependents,
}

/// Outcome of a legal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ProcessState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: ProcessState) -> Self {
        Self {
            next,
            effects: vec![Effect::NotifyStatus],
        }
    }

    fn with(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Computes the next state for `event` in `state`, or `None` when the event does not apply.
pub fn transition(state: ProcessState, event: &LifecycleEvent) -> Option<Transition> {
    use LifecycleEvent as E;
    use ProcessState as S;

    let outcome = match (state, event) {
        (S::Stopped | S::Failed, _) => return None,

        (S::Pending | S::Restarting, E::Control(Control::Start)) => Transition::to(S::Starting),

        (S::Starting, E::Launch(LaunchOutcome::Started { .. })) => Transition::to(S::Running),
        (S::Starting, E::Launch(LaunchOutcome::Failed { .. })) => {
            Transition::to(S::Crashed).with(Effect::RequestRestart)
        }
        (S::Stopping, E::Launch(LaunchOutcome::Failed { .. })) => Transition::to(S::Stopped),

        (S::Running | S::Unhealthy, E::Health(HealthStatus::Ready)) => Transition::to(S::Ready),
        (S::Running | S::Ready, E::Health(HealthStatus::Unhealthy)) => {
            Transition::to(S::Unhealthy)
        }

        (S::Starting | S::Running | S::Ready | S::Unhealthy, E::Exit(_)) => {
            Transition::to(S::Crashed).with(Effect::RequestRestart)
        }
        (S::Stopping, E::Exit(_)) => Transition::to(S::Stopped),

        (S::Crashed, E::Control(Control::Restart)) => Transition::to(S::Restarting),
        (S::Crashed, E::Control(Control::GiveUp)) => {
            Transition::to(S::Failed).with(Effect::StopDependents)
        }
        (S::Crashed, E::Control(Control::Retire)) => {
            Transition::to(S::Stopped).with(Effect::StopDependents)
        }

        (
            S::Pending | S::Starting | S::Running | S::Ready | S::Unhealthy | S::Crashed
            | S::Restarting,
            E::Control(Control::Stop | Control::DependencyFailed { .. }),
        ) => Transition::to(S::Stopping),

        _ => return None,
    };

    Some(outcome)
}
