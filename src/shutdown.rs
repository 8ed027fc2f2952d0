//! Reverse-order stop planning.
//!
//! The coordinator decides *which* processes may be stopped next; the scheduler does the
//! signalling and feeds the resulting exits back in. A process is released for stopping only
//! once every one of its dependents has reached a terminal state.
use std::collections::BTreeSet;

use tracing::debug;

use crate::graph::DependencyGraph;
use crate::lifecycle::ProcessState;

#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    active: bool,
    issued: BTreeSet<String>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks shutdown as requested. Returns `false` if it already was.
    pub fn begin(&mut self) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        true
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Processes that should receive a stop now, in stop order. Each process is returned at
    /// most once per shutdown; terminal processes are never returned.
    pub fn next_stops<F>(&mut self, graph: &DependencyGraph, state_of: F) -> Vec<String>
    where
        F: Fn(&str) -> ProcessState,
    {
        if !self.active {
            return Vec::new();
        }

        let mut batch = Vec::new();
        for name in graph.stop_order() {
            if self.issued.contains(&name) || state_of(&name).is_terminal() {
                continue;
            }

            let blocked_by: Vec<&String> = graph
                .dependents(&name)
                .iter()
                .filter(|dependent| !state_of(dependent).is_terminal())
                .collect();
            if !blocked_by.is_empty() {
                debug!("Deferring stop of '{name}' until {blocked_by:?} have stopped");
                continue;
            }

            self.issued.insert(name.clone());
            batch.push(name);
        }
        batch
    }

    /// `true` once shutdown was requested and every process is terminal.
    pub fn is_complete<F>(&self, graph: &DependencyGraph, state_of: F) -> bool
    where
        F: Fn(&str) -> ProcessState,
    {
        self.active
            && graph
                .start_order()
                .iter()
                .all(|name| state_of(name).is_terminal())
    }
}
