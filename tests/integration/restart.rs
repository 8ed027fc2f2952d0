#[path = "common/mod.rs"]
mod common;

use std::{thread, time::Duration};

use common::{read_lines, shell, wait_for_snapshot, wait_for_state};
use dpsup::{
    AggregateHealth, Plugin, ProcessState, RestartMode, RestartPolicy, StaticSource, Supervisor,
    descriptor::Backoff,
};
use tempfile::tempdir;

fn schedule(delays_ms: &[u64], max_failures: u32) -> RestartPolicy {
    RestartPolicy {
        max_failures: Some(max_failures),
        backoff: Backoff::Schedule(delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect()),
        ..RestartPolicy::default()
    }
}

#[test]
fn crash_loop_gives_up_after_max_failures() {
    let temp = tempdir().expect("failed to create tempdir");
    let runs = temp.path().join("runs.log");

    let flaky = shell("flaky", &format!("echo run >> {}; exit 1", runs.display()))
        .with_restart(schedule(&[50, 50, 50], 3));

    let mut supervisor = Supervisor::new(StaticSource::new(vec![flaky]));
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    let snapshot = wait_for_state(&supervisor, "flaky", ProcessState::Failed);
    let flaky = snapshot.process("flaky").unwrap();
    assert_eq!(flaky.consecutive_failures, 3);
    assert_eq!(flaky.total_restarts, 2);
    assert_eq!(flaky.last_exit_code, Some(1));
    assert_eq!(
        flaky.condition.as_deref(),
        Some("gave up after 3 consecutive failures")
    );
    assert_eq!(snapshot.health, AggregateHealth::Down);

    thread::sleep(Duration::from_millis(200));
    assert_eq!(read_lines(&runs).len(), 3);

    supervisor.close().expect("close failed");
}

#[test]
fn clean_exit_retires_on_failure_process() {
    let temp = tempdir().expect("failed to create tempdir");
    let runs = temp.path().join("runs.log");

    let oneshot = shell("oneshot", &format!("echo run >> {}; exit 0", runs.display()))
        .with_restart(schedule(&[10], 3));

    let mut supervisor = Supervisor::new(StaticSource::new(vec![oneshot]));
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    let snapshot = wait_for_state(&supervisor, "oneshot", ProcessState::Stopped);
    let oneshot = snapshot.process("oneshot").unwrap();
    assert_eq!(oneshot.condition.as_deref(), Some("exited cleanly"));
    assert_eq!(oneshot.last_exit_code, Some(0));
    assert_eq!(oneshot.total_restarts, 0);

    thread::sleep(Duration::from_millis(200));
    assert_eq!(read_lines(&runs).len(), 1);

    supervisor.close().expect("close failed");
}

#[test]
fn always_mode_restarts_clean_exits() {
    let temp = tempdir().expect("failed to create tempdir");
    let runs = temp.path().join("runs.log");

    let looping = shell("looping", &format!("echo run >> {}; exit 0", runs.display()))
        .with_restart(RestartPolicy {
            mode: RestartMode::Always,
            ..schedule(&[20], 2)
        });

    let mut supervisor = Supervisor::new(StaticSource::new(vec![looping]));
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    let snapshot = wait_for_state(&supervisor, "looping", ProcessState::Failed);
    assert_eq!(snapshot.process("looping").unwrap().total_restarts, 1);
    assert_eq!(read_lines(&runs).len(), 2);

    supervisor.close().expect("close failed");
}

#[test]
fn never_mode_fails_on_first_crash() {
    let temp = tempdir().expect("failed to create tempdir");
    let runs = temp.path().join("runs.log");

    let fragile = shell("fragile", &format!("echo run >> {}; exit 7", runs.display()))
        .with_restart(RestartPolicy {
            mode: RestartMode::Never,
            ..RestartPolicy::default()
        });

    let mut supervisor = Supervisor::new(StaticSource::new(vec![fragile]));
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    let snapshot = wait_for_state(&supervisor, "fragile", ProcessState::Failed);
    let fragile = snapshot.process("fragile").unwrap();
    assert_eq!(fragile.last_exit_code, Some(7));
    assert_eq!(fragile.total_restarts, 0);
    assert_eq!(read_lines(&runs).len(), 1);

    supervisor.close().expect("close failed");
}

#[test]
fn spawn_failure_counts_against_the_budget() {
    let missing = dpsup::ProcessDescriptor::new("ghost", "/nonexistent/dpsup-binary")
        .with_restart(schedule(&[10], 2));

    let mut supervisor = Supervisor::new(StaticSource::new(vec![missing]));
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    let snapshot = wait_for_state(&supervisor, "ghost", ProcessState::Failed);
    let ghost = snapshot.process("ghost").unwrap();
    assert_eq!(ghost.consecutive_failures, 2);
    assert_eq!(ghost.pid, None);

    supervisor.close().expect("close failed");
}

#[test]
fn failed_dependency_cascades_to_dependents() {
    let temp = tempdir().expect("failed to create tempdir");
    let dependent_log = temp.path().join("agent.log");

    let vpp = shell("vpp", "sleep 0.3; exit 1").with_restart(schedule(&[30], 2));
    let agent = shell(
        "agent",
        &format!("echo started >> {}; exec sleep 30", dependent_log.display()),
    )
    .depends_on(["vpp"]);
    let exporter = shell("exporter", "exec sleep 30").depends_on(["agent"]);

    let mut supervisor = Supervisor::new(StaticSource::new(vec![vpp, agent, exporter]));
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    let snapshot = wait_for_state(&supervisor, "vpp", ProcessState::Failed);
    let snapshot = if snapshot.all_terminal() {
        snapshot
    } else {
        wait_for_state(&supervisor, "exporter", ProcessState::Stopped)
    };

    assert_eq!(snapshot.health, AggregateHealth::Down);
    for name in ["agent", "exporter"] {
        let entry = snapshot.process(name).unwrap();
        assert_eq!(entry.state, ProcessState::Stopped, "{name} should be stopped");
        assert!(entry.condition.is_some(), "{name} should explain why it stopped");
    }
    assert_eq!(
        snapshot.process("agent").unwrap().condition.as_deref(),
        Some("dependency 'vpp' failed")
    );

    supervisor.close().expect("close failed");
}

#[test]
fn dependency_failing_before_ready_never_launches_dependents() {
    let temp = tempdir().expect("failed to create tempdir");
    let marker = temp.path().join("agent.started");

    let vpp = dpsup::ProcessDescriptor::new("vpp", "/nonexistent/dpsup-vpp").with_restart(
        RestartPolicy {
            mode: RestartMode::Never,
            ..RestartPolicy::default()
        },
    );
    let agent = shell(
        "agent",
        &format!("touch {}; exec sleep 30", marker.display()),
    )
    .depends_on(["vpp"]);

    let mut supervisor = Supervisor::new(StaticSource::new(vec![vpp, agent]));
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    let snapshot = wait_for_snapshot(&supervisor, Duration::from_secs(10), |snapshot| {
        snapshot.all_terminal()
    });
    assert_eq!(snapshot.process("vpp").unwrap().state, ProcessState::Failed);

    let agent = snapshot.process("agent").unwrap();
    assert_eq!(agent.state, ProcessState::Stopped);
    assert_eq!(agent.pid, None);
    assert_eq!(agent.condition.as_deref(), Some("dependency 'vpp' failed"));

    thread::sleep(Duration::from_millis(200));
    assert!(!marker.exists());

    supervisor.close().expect("close failed");
}
