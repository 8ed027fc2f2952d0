#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    process::{Command as StdCommand, Stdio},
    thread,
    time::{Duration, Instant},
};

use assert_cmd::Command;
use dpsup::{
    AggregateHealth, Plugin, ProcessState, StaticSource, Supervisor, config::SupervisorSettings,
    status::load_snapshot,
};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use predicates::{boolean::PredicateBooleanExt, str::contains};
use tempfile::tempdir;

#[test]
fn check_prints_start_order() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = temp.path().join("dpsup.yaml");
    fs::write(
        &config_path,
        r#"version: "1"
processes:
  agent:
    command: "sleep 30"
    depends_on: [vpp]
  vpp:
    command: "sleep 30"
  exporter:
    command: "sleep 30"
    depends_on: [agent]
"#,
    )
    .expect("failed to write config");

    Command::new(assert_cmd::cargo::cargo_bin!("dpsup"))
        .arg("check")
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .assert()
        .success()
        .stdout(contains("Configuration OK: 3 processes"))
        .stdout(contains("Start order: vpp -> agent -> exporter"));
}

#[test]
fn check_rejects_cycles() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = temp.path().join("dpsup.yaml");
    fs::write(
        &config_path,
        r#"version: "1"
processes:
  a:
    command: "sleep 30"
    depends_on: [b]
  b:
    command: "sleep 30"
    depends_on: [a]
"#,
    )
    .expect("failed to write config");

    Command::new(assert_cmd::cargo::cargo_bin!("dpsup"))
        .args(["check", "-c"])
        .arg(&config_path)
        .assert()
        .failure()
        .stderr(contains("Detected dependency cycle"));
}

#[test]
fn check_reports_missing_config() {
    let temp = tempdir().expect("failed to create tempdir");

    Command::new(assert_cmd::cargo::cargo_bin!("dpsup"))
        .args(["check", "-c"])
        .arg(temp.path().join("absent.yaml"))
        .assert()
        .failure()
        .stderr(contains("absent.yaml"));
}

#[test]
fn status_renders_table_and_json() {
    let temp = tempdir().expect("failed to create tempdir");
    let status_file = temp.path().join("status.json");

    let settings = SupervisorSettings {
        status_file: Some(status_file.clone()),
        ..SupervisorSettings::default()
    };
    let mut supervisor = Supervisor::new(
        StaticSource::new(vec![
            dpsup::ProcessDescriptor::shell("vpp", "sleep 30"),
            dpsup::ProcessDescriptor::shell("agent", "sleep 30").depends_on(["vpp"]),
        ])
        .with_settings(settings),
    );
    supervisor.init().expect("init failed");

    Command::new(assert_cmd::cargo::cargo_bin!("dpsup"))
        .args(["status", "--file"])
        .arg(&status_file)
        .assert()
        .success()
        .stdout(contains("PROCESS"))
        .stdout(contains("vpp").and(contains("agent")))
        .stdout(contains("pending"));

    Command::new(assert_cmd::cargo::cargo_bin!("dpsup"))
        .args(["status", "--json", "--process", "agent", "--file"])
        .arg(&status_file)
        .assert()
        .success()
        .stdout(contains("\"name\": \"agent\""))
        .stdout(contains("\"vpp\"").count(1));

    Command::new(assert_cmd::cargo::cargo_bin!("dpsup"))
        .args(["status", "--process", "missing", "--file"])
        .arg(&status_file)
        .assert()
        .failure()
        .stderr(contains("process 'missing' not found"));
}

#[test]
fn run_supervises_until_sigterm() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config_path = dir.join("dpsup.yaml");
    let status_file = dir.join("status.json");
    fs::write(
        &config_path,
        r#"version: "1"
supervisor:
  status_file: status.json
  probe_interval: 50ms
  stop_grace_period: 2s
processes:
  base:
    command: "exec sleep 30"
  app:
    command: "exec sleep 30"
    depends_on: [base]
"#,
    )
    .expect("failed to write config");

    let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin!("dpsup"))
        .args(["--log-level", "warn", "run", "--config"])
        .arg(&config_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start dpsup");

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(snapshot) = load_snapshot(&status_file)
            && snapshot.health == AggregateHealth::Healthy
        {
            break;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("dpsup never reported healthy");
        }
        thread::sleep(Duration::from_millis(50));
    }

    let pids: Vec<u32> = load_snapshot(&status_file)
        .unwrap()
        .processes
        .iter()
        .filter_map(|entry| entry.pid)
        .collect();
    assert_eq!(pids.len(), 2);

    signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM)
        .expect("failed to signal dpsup");
    let status = child.wait().expect("failed to wait for dpsup");
    assert!(status.success());

    let snapshot = load_snapshot(&status_file).expect("status file missing after run");
    assert!(snapshot.all_terminal());
    assert!(snapshot
        .processes
        .iter()
        .all(|entry| entry.state == ProcessState::Stopped));
    for pid in pids {
        common::wait_for_process_exit(pid);
    }
}
