#[path = "common/mod.rs"]
mod common;

use std::{
    net::TcpListener,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use common::{fast_probe, shell, wait_for_snapshot, wait_for_state};
use dpsup::{
    AggregateHealth, Plugin, ProbeMethod, ProbeOutcome, ProcessState, ReadinessProbe,
    RestartPolicy, StaticSource, Supervisor, descriptor::Backoff, health::ProbeTarget,
    health::HealthStatus,
};

struct Toggle(Arc<AtomicBool>);

impl ReadinessProbe for Toggle {
    fn check(&mut self, _target: &ProbeTarget, _timeout: Duration) -> ProbeOutcome {
        if self.0.load(Ordering::SeqCst) {
            ProbeOutcome::Success
        } else {
            ProbeOutcome::Failure("toggle is off".into())
        }
    }
}

struct Hang(Arc<AtomicBool>);

impl ReadinessProbe for Hang {
    fn check(&mut self, _target: &ProbeTarget, _timeout: Duration) -> ProbeOutcome {
        while !self.0.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(10));
        }
        ProbeOutcome::Success
    }
}

fn toggled_supervisor(flag: &Arc<AtomicBool>, kill_after: Option<u32>) -> Supervisor {
    let mut probe = fast_probe(ProbeMethod::Custom("toggle".into()));
    probe.kill_after = kill_after;

    let dataplane = shell("dataplane", "exec sleep 30")
        .with_probe(probe)
        .with_restart(RestartPolicy {
            max_failures: Some(5),
            backoff: Backoff::Fixed(Duration::from_millis(20)),
            ..RestartPolicy::default()
        });

    let mut supervisor = Supervisor::new(StaticSource::new(vec![dataplane]));
    let shared = Arc::clone(flag);
    supervisor.register_probe("toggle", move || {
        Box::new(Toggle(Arc::clone(&shared))) as Box<dyn ReadinessProbe>
    });
    supervisor
}

#[test]
fn failing_probe_marks_unhealthy_and_recovers() {
    let flag = Arc::new(AtomicBool::new(true));
    let mut supervisor = toggled_supervisor(&flag, None);
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    let ready = wait_for_state(&supervisor, "dataplane", ProcessState::Ready);
    let pid = ready.process("dataplane").unwrap().pid;
    assert!(pid.is_some());
    assert_eq!(ready.health, AggregateHealth::Healthy);

    flag.store(false, Ordering::SeqCst);
    let unhealthy = wait_for_state(&supervisor, "dataplane", ProcessState::Unhealthy);
    let entry = unhealthy.process("dataplane").unwrap();
    assert_eq!(entry.health, HealthStatus::Unhealthy);
    assert_eq!(entry.pid, pid, "unhealthy processes are not restarted");
    assert!(entry.condition.is_some());
    assert_eq!(unhealthy.health, AggregateHealth::Degraded);

    flag.store(true, Ordering::SeqCst);
    let recovered = wait_for_state(&supervisor, "dataplane", ProcessState::Ready);
    let entry = recovered.process("dataplane").unwrap();
    assert_eq!(entry.pid, pid);
    assert_eq!(entry.condition, None);
    assert_eq!(entry.total_restarts, 0);

    supervisor.close().expect("close failed");
}

#[test]
fn hung_process_is_killed_after_kill_threshold() {
    let flag = Arc::new(AtomicBool::new(true));
    let mut supervisor = toggled_supervisor(&flag, Some(4));
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    let ready = wait_for_state(&supervisor, "dataplane", ProcessState::Ready);
    let first_pid = ready.process("dataplane").unwrap().pid;

    flag.store(false, Ordering::SeqCst);
    let restarted = wait_for_snapshot(&supervisor, Duration::from_secs(10), |snapshot| {
        snapshot
            .process("dataplane")
            .is_some_and(|entry| entry.total_restarts >= 1)
    });
    let entry = restarted.process("dataplane").unwrap();
    assert_eq!(entry.last_signal, Some(9));

    flag.store(true, Ordering::SeqCst);
    let ready = wait_for_state(&supervisor, "dataplane", ProcessState::Ready);
    let second_pid = ready.process("dataplane").unwrap().pid;
    assert!(second_pid.is_some());
    assert_ne!(second_pid, first_pid);

    supervisor.close().expect("close failed");
}

#[test]
fn tcp_probe_waits_for_listener() {
    let reserved = TcpListener::bind("127.0.0.1:0").expect("failed to bind probe port");
    let address = reserved.local_addr().unwrap();
    drop(reserved);

    let server = shell("server", "exec sleep 30")
        .with_probe(fast_probe(ProbeMethod::Tcp(address.to_string())));
    let mut supervisor = Supervisor::new(StaticSource::new(vec![server]));
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    wait_for_snapshot(&supervisor, Duration::from_secs(10), |snapshot| {
        snapshot
            .process("server")
            .is_some_and(|entry| entry.pid.is_some())
    });
    thread::sleep(Duration::from_millis(150));
    assert_ne!(
        supervisor.snapshot().process("server").unwrap().state,
        ProcessState::Ready
    );

    let _listener = TcpListener::bind(address).expect("failed to rebind probe port");
    wait_for_state(&supervisor, "server", ProcessState::Ready);

    supervisor.close().expect("close failed");
}

#[test]
fn command_probe_gates_readiness() {
    let temp = tempfile::tempdir().expect("failed to create tempdir");
    let flag = temp.path().join("up");

    let api = shell(
        "api",
        &format!("sleep 0.2; touch {}; exec sleep 30", flag.display()),
    )
    .with_probe(fast_probe(ProbeMethod::Command(format!(
        "test -f {}",
        flag.display()
    ))));

    let mut supervisor = Supervisor::new(StaticSource::new(vec![api]));
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    let snapshot = wait_for_state(&supervisor, "api", ProcessState::Ready);
    assert!(flag.exists());
    assert_eq!(snapshot.process("api").unwrap().health, HealthStatus::Ready);

    supervisor.close().expect("close failed");
}

#[test]
fn hanging_probe_counts_as_timeouts() {
    let responsive = Arc::new(AtomicBool::new(true));
    let mut probe = fast_probe(ProbeMethod::Custom("hang".into()));
    probe.timeout = Duration::from_millis(100);

    let mut supervisor = Supervisor::new(StaticSource::new(vec![
        shell("dataplane", "exec sleep 30").with_probe(probe),
    ]));
    let shared = Arc::clone(&responsive);
    supervisor.register_probe("hang", move || {
        Box::new(Hang(Arc::clone(&shared))) as Box<dyn ReadinessProbe>
    });
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    let ready = wait_for_state(&supervisor, "dataplane", ProcessState::Ready);
    let pid = ready.process("dataplane").unwrap().pid;

    responsive.store(false, Ordering::SeqCst);
    let unhealthy = wait_for_state(&supervisor, "dataplane", ProcessState::Unhealthy);
    let entry = unhealthy.process("dataplane").unwrap();
    assert_eq!(entry.health, HealthStatus::Unhealthy);
    assert_eq!(entry.pid, pid);

    responsive.store(true, Ordering::SeqCst);
    let recovered = wait_for_state(&supervisor, "dataplane", ProcessState::Ready);
    assert_eq!(recovered.process("dataplane").unwrap().pid, pid);

    supervisor.close().expect("close failed");
}
