#![allow(dead_code)]

use std::{
    fs,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use dpsup::{
    ProbeConfig, ProbeMethod, ProcessDescriptor, ProcessState, Supervisor, SupervisorSnapshot,
};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Probe settings tight enough for tests to observe transitions quickly.
pub fn fast_probe(method: ProbeMethod) -> ProbeConfig {
    ProbeConfig {
        interval: Duration::from_millis(25),
        timeout: Duration::from_millis(500),
        failure_threshold: 2,
        ..ProbeConfig::new(method)
    }
}

/// Like [`fast_probe`], but never reports `Unhealthy` within a test's lifetime.
pub fn patient_probe(method: ProbeMethod) -> ProbeConfig {
    ProbeConfig {
        failure_threshold: 10_000,
        ..fast_probe(method)
    }
}

/// Shell-backed descriptor with a fast liveness probe and a short stop grace period.
pub fn shell(name: &str, command: &str) -> ProcessDescriptor {
    ProcessDescriptor::shell(name, command)
        .with_probe(fast_probe(ProbeMethod::Liveness))
        .with_stop_grace_period(Duration::from_secs(2))
}

pub fn wait_for_snapshot<F>(supervisor: &Supervisor, timeout: Duration, check: F) -> SupervisorSnapshot
where
    F: Fn(&SupervisorSnapshot) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = supervisor.snapshot();
        if check(&snapshot) {
            return snapshot;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for supervisor state; last snapshot: {snapshot:#?}");
        }

        thread::sleep(Duration::from_millis(20));
    }
}

pub fn wait_for_state(
    supervisor: &Supervisor,
    process: &str,
    state: ProcessState,
) -> SupervisorSnapshot {
    wait_for_snapshot(supervisor, Duration::from_secs(10), |snapshot| {
        snapshot
            .process(process)
            .is_some_and(|entry| entry.state == state)
    })
}

pub fn wait_for_lines(path: &Path, expected: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            let lines: Vec<_> = content.lines().map(|line| line.to_string()).collect();
            if lines.len() >= expected {
                return lines;
            }
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {expected} lines in {:?}", path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|content| content.lines().map(|line| line.to_string()).collect())
        .unwrap_or_default()
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some_and(|process| {
        !matches!(process.status(), sysinfo::ProcessStatus::Zombie)
    })
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Timed out waiting for PID {pid} to exit");
}
