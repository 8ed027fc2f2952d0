#[path = "common/mod.rs"]
mod common;

use std::{fs, thread, time::Duration};

use common::{fast_probe, patient_probe, read_lines, shell, wait_for_lines, wait_for_state};
use dpsup::{
    AggregateHealth, Plugin, ProbeMethod, ProcessState, StaticSource, Supervisor,
    SupervisorError, config::SupervisorSettings, status::load_snapshot,
};
use tempfile::tempdir;

#[test]
fn dependent_launches_only_after_dependency_is_ready() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let log = dir.join("order.log");
    let ready = dir.join("a.ready");

    let a = shell(
        "a",
        &format!(
            "echo a-start >> {log}; sleep 0.3; touch {ready}; exec sleep 30",
            log = log.display(),
            ready = ready.display()
        ),
    )
    .with_probe(fast_probe(ProbeMethod::File(ready.clone())));
    let b = shell(
        "b",
        &format!(
            "echo b-start >> {log}; test -f {ready} && echo b-saw-ready >> {log}; exec sleep 30",
            log = log.display(),
            ready = ready.display()
        ),
    )
    .depends_on(["a"]);

    let mut supervisor = Supervisor::new(StaticSource::new(vec![b, a]));
    supervisor.init().expect("init failed");
    assert_eq!(supervisor.start_order(), ["a".to_string(), "b".to_string()]);
    supervisor.after_init().expect("after_init failed");

    let snapshot = wait_for_state(&supervisor, "b", ProcessState::Ready);
    assert_eq!(snapshot.process("a").unwrap().state, ProcessState::Ready);
    assert_eq!(snapshot.health, AggregateHealth::Healthy);
    assert!(snapshot.process("b").unwrap().pid.is_some());

    let lines = wait_for_lines(&log, 3);
    assert_eq!(lines, vec!["a-start", "b-start", "b-saw-ready"]);

    supervisor.close().expect("close failed");
}

#[test]
fn cycle_is_rejected_before_anything_spawns() {
    let temp = tempdir().expect("failed to create tempdir");
    let marker = temp.path().join("spawned");
    let command = format!("touch {}; exec sleep 30", marker.display());

    let mut supervisor = Supervisor::new(StaticSource::new(vec![
        shell("a", &command).depends_on(["c"]),
        shell("b", &command).depends_on(["a"]),
        shell("c", &command).depends_on(["b"]),
    ]));

    let err = supervisor.init().expect_err("cycle should be rejected");
    assert!(matches!(err, SupervisorError::CyclicDependency { .. }));
    assert!(err.is_configuration_error());
    assert!(matches!(
        supervisor.after_init(),
        Err(SupervisorError::NotInitialized)
    ));

    thread::sleep(Duration::from_millis(200));
    assert!(!marker.exists());
    supervisor.close().expect("close after failed init should be a no-op");
}

#[test]
fn unknown_dependency_is_rejected() {
    let mut supervisor =
        Supervisor::new(StaticSource::new(vec![shell("agent", "sleep 30").depends_on(["vpp"])]));
    let err = supervisor.init().expect_err("unknown dependency should be rejected");
    assert!(matches!(err, SupervisorError::UnknownDependency { .. }));
}

#[test]
fn dependent_waits_while_dependency_is_not_ready() {
    let temp = tempdir().expect("failed to create tempdir");
    let never = temp.path().join("never.ready");
    let marker = temp.path().join("b.started");

    let a = shell("a", "exec sleep 30").with_probe(patient_probe(ProbeMethod::File(never)));
    let b = shell("b", &format!("touch {}; exec sleep 30", marker.display())).depends_on(["a"]);

    let mut supervisor = Supervisor::new(StaticSource::new(vec![a, b]));
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    wait_for_state(&supervisor, "a", ProcessState::Running);
    thread::sleep(Duration::from_millis(400));

    let snapshot = supervisor.snapshot();
    let b = snapshot.process("b").unwrap();
    assert_eq!(b.state, ProcessState::Pending);
    assert_eq!(b.pid, None);
    assert_eq!(snapshot.health, AggregateHealth::Starting);
    assert!(!marker.exists());

    supervisor.close().expect("close failed");
    let snapshot = supervisor.snapshot();
    assert!(snapshot.all_terminal());
    assert_eq!(snapshot.process("b").unwrap().state, ProcessState::Stopped);
}

#[test]
fn independent_processes_start_in_the_same_wave() {
    let temp = tempdir().expect("failed to create tempdir");
    let log = temp.path().join("wave.log");

    let processes = ["x", "y", "z"]
        .iter()
        .map(|name| {
            shell(
                name,
                &format!("echo {name} >> {}; exec sleep 30", log.display()),
            )
        })
        .collect();

    let mut supervisor = Supervisor::new(StaticSource::new(processes));
    supervisor.init().expect("init failed");
    supervisor.after_init().expect("after_init failed");

    for name in ["x", "y", "z"] {
        wait_for_state(&supervisor, name, ProcessState::Ready);
    }
    let mut lines = read_lines(&log);
    lines.sort();
    assert_eq!(lines, vec!["x", "y", "z"]);

    supervisor.close().expect("close failed");
}

#[test]
fn status_file_tracks_snapshots() {
    let temp = tempdir().expect("failed to create tempdir");
    let status_file = temp.path().join("status.json");

    let settings = SupervisorSettings {
        status_file: Some(status_file.clone()),
        ..SupervisorSettings::default()
    };
    let mut supervisor = Supervisor::new(
        StaticSource::new(vec![shell("solo", "exec sleep 30")]).with_settings(settings),
    );
    supervisor.init().expect("init failed");

    let initial = load_snapshot(&status_file).expect("status file should exist after init");
    assert_eq!(initial.process("solo").unwrap().state, ProcessState::Pending);

    supervisor.after_init().expect("after_init failed");
    wait_for_state(&supervisor, "solo", ProcessState::Ready);
    supervisor.close().expect("close failed");

    let last = load_snapshot(&status_file).expect("status file should be readable");
    assert_eq!(last.process("solo").unwrap().state, ProcessState::Stopped);
    assert_eq!(last.health, AggregateHealth::Stopped);
    assert!(fs::metadata(&status_file).unwrap().len() > 0);
}
