//! Restart policy engine: decides whether and when a failed process is relaunched.
use std::time::{Duration, Instant};

use crate::descriptor::{RestartMode, RestartPolicy};
use crate::lifecycle::ExitKind;

/// Failure bookkeeping for one process, kept across launch attempts.
#[derive(Debug, Clone, Default)]
pub struct FailureHistory {
    consecutive_failures: u32,
    total_restarts: u32,
    ready_since: Option<Instant>,
}

impl FailureHistory {
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_restarts(&self) -> u32 {
        self.total_restarts
    }

    /// Records that the process became `Ready`. Repeated calls keep the original timestamp.
    pub fn mark_ready(&mut self, now: Instant) {
        if self.ready_since.is_none() {
            self.ready_since = Some(now);
        }
    }

    /// Records that the process left `Ready`, clearing the counter first if it had been ready
    /// for at least `reset_after`.
    pub fn mark_not_ready(&mut self, now: Instant, reset_after: Duration) {
        self.settle(now, reset_after);
        self.ready_since = None;
    }

    /// Consecutive failures as they would be counted right now, taking a sustained `Ready`
    /// period into account without mutating the history.
    pub fn effective_failures(&self, now: Instant, reset_after: Duration) -> u32 {
        if self.ready_long_enough(now, reset_after) {
            0
        } else {
            self.consecutive_failures
        }
    }

    fn ready_long_enough(&self, now: Instant, reset_after: Duration) -> bool {
        self.ready_since
            .is_some_and(|since| now.saturating_duration_since(since) >= reset_after)
    }

    fn settle(&mut self, now: Instant, reset_after: Duration) {
        if self.ready_long_enough(now, reset_after) {
            self.consecutive_failures = 0;
        }
    }
}

/// What to do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartNow,
    RestartAfter(Duration),
    /// The budget is exhausted; the process becomes `Failed`.
    GiveUp { failures: u32 },
    /// The process exited cleanly and is not restarted; it becomes `Stopped`.
    Retire,
}

/// Stateless policy evaluator; all state lives in [`FailureHistory`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RestartPolicyEngine;

impl RestartPolicyEngine {
    pub fn new() -> Self {
        Self
    }

    /// Decides the fate of a process that just crashed or exited. `exit` is `None` when the
    /// OS could not spawn the process at all.
    pub fn decide(
        &self,
        policy: &RestartPolicy,
        history: &mut FailureHistory,
        exit: Option<ExitKind>,
        now: Instant,
    ) -> RestartDecision {
        history.mark_not_ready(now, policy.reset_after);

        if exit.is_some_and(ExitKind::is_clean) && policy.mode != RestartMode::Always {
            return RestartDecision::Retire;
        }

        history.consecutive_failures = history.consecutive_failures.saturating_add(1);
        let failures = history.consecutive_failures;

        if policy.mode == RestartMode::Never {
            return RestartDecision::GiveUp { failures };
        }

        if let Some(max) = policy.max_failures
            && failures >= max
        {
            return RestartDecision::GiveUp { failures };
        }

        history.total_restarts = history.total_restarts.saturating_add(1);
        let delay = policy.backoff.delay(failures);
        if delay.is_zero() {
            RestartDecision::RestartNow
        } else {
            RestartDecision::RestartAfter(delay)
        }
    }
}
