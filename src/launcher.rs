//! OS process spawning, exit watching and signalling.
use std::{
    io::{self, BufRead, BufReader, Read},
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Child, Command, ExitStatus, Stdio},
    sync::Arc,
    thread,
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::{Pid, getpgid},
};
use tracing::{debug, error, info, warn};

use crate::descriptor::ProcessDescriptor;
use crate::error::SupervisorError;
use crate::lifecycle::{ExitKind, LaunchOutcome, LifecycleEvent};

/// Builds the command for a descriptor: own process group, parent-death signal on Linux,
/// environment overlay on top of the supervisor's environment, piped output.
fn build_command(descriptor: &ProcessDescriptor) -> Command {
    let mut cmd = Command::new(&descriptor.executable);
    cmd.args(&descriptor.args)
        .envs(&descriptor.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = &descriptor.working_dir {
        cmd.current_dir(dir);
    }

    if !descriptor.env.is_empty() {
        let keys: Vec<_> = descriptor.env.keys().collect();
        debug!("Setting environment variables for '{}': {:?}", descriptor.name, keys);
    }

    unsafe {
        cmd.pre_exec(|| {
            // Own process group so stop signals reach the whole tree without touching ours.
            if libc::setpgid(0, 0) < 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    cmd
}

/// Spawns the process described by `descriptor`, forwarding its output into the log stream.
pub(crate) fn launch(descriptor: &ProcessDescriptor) -> Result<Child, SupervisorError> {
    debug!(
        "Launching '{}': {} {:?}",
        descriptor.name,
        descriptor.executable.display(),
        descriptor.args
    );

    let mut child = build_command(descriptor)
        .spawn()
        .map_err(|source| SupervisorError::LaunchFailed {
            process: descriptor.name.clone(),
            source,
        })?;

    if let Some(stdout) = child.stdout.take() {
        forward_output(&descriptor.name, stdout, OutputStream::Stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_output(&descriptor.name, stderr, OutputStream::Stderr);
    }

    Ok(child)
}

#[derive(Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

fn forward_output<R>(process: &str, reader: R, stream: OutputStream)
where
    R: Read + Send + 'static,
{
    let process = process.to_string();
    let spawned = thread::Builder::new()
        .name(format!("output-{process}"))
        .spawn(move || {
            for line in BufReader::new(reader).lines().map_while(Result::ok) {
                match stream {
                    OutputStream::Stdout => info!("[{process}] {line}"),
                    OutputStream::Stderr => warn!("[{process}] {line}"),
                }
            }
        });

    if let Err(err) = spawned {
        warn!("Failed to start output forwarder: {err}");
    }
}

/// Maps an exit status onto the lifecycle's exit classification.
pub(crate) fn exit_kind(status: ExitStatus) -> ExitKind {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitKind::Exited(code),
        (None, Some(signal)) => ExitKind::Signaled(signal),
        (None, None) => ExitKind::Vanished,
    }
}

/// Launches `descriptor` on a dedicated watcher thread and reports the launch outcome followed
/// by the exit through `notify`.
///
/// The watcher thread stays blocked in `wait()` for the child's whole lifetime. On Linux this
/// keeps `PR_SET_PDEATHSIG` from firing, since it is tied to the spawning thread rather than
/// the supervisor process.
pub(crate) fn spawn_watcher<F>(descriptor: Arc<ProcessDescriptor>, notify: F) -> io::Result<()>
where
    F: Fn(LifecycleEvent) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("watch-{}", descriptor.name))
        .spawn(move || {
            let mut child = match launch(&descriptor) {
                Ok(child) => child,
                Err(err) => {
                    error!("{err}");
                    notify(LifecycleEvent::Launch(LaunchOutcome::Failed {
                        reason: err.to_string(),
                    }));
                    return;
                }
            };

            let pid = child.id();
            info!("Process '{}' started with PID {pid}", descriptor.name);
            notify(LifecycleEvent::Launch(LaunchOutcome::Started { pid }));

            let exit = match child.wait() {
                Ok(status) => exit_kind(status),
                Err(err) => {
                    warn!("Failed to wait for '{}' (PID {pid}): {err}", descriptor.name);
                    ExitKind::Vanished
                }
            };
            debug!("Process '{}' (PID {pid}) exited: {exit}", descriptor.name);
            notify(LifecycleEvent::Exit(exit));
        })?;

    Ok(())
}

/// Sends `sig` to the process group led by `pid`, falling back to the single process when it
/// does not lead its own group. Returns `Ok(false)` when the process no longer exists.
pub(crate) fn signal_process(process: &str, pid: u32, sig: Signal) -> Result<bool, SupervisorError> {
    let target = Pid::from_raw(pid as i32);
    let own_group = getpgid(None).ok();

    match getpgid(Some(target)) {
        Ok(group) if group == target && Some(group) != own_group => {
            match signal::killpg(group, sig) {
                Ok(()) => return Ok(true),
                Err(Errno::ESRCH) => return Ok(false),
                Err(Errno::EPERM) => {
                    warn!(
                        "Insufficient permissions to signal process group {group} for '{process}'. Falling back to direct signal"
                    );
                }
                Err(source) => {
                    return Err(SupervisorError::SignalError {
                        process: process.to_string(),
                        source,
                    });
                }
            }
        }
        Ok(_) => {}
        Err(Errno::ESRCH) => return Ok(false),
        Err(err) => debug!("getpgid({pid}) failed for '{process}': {err}"),
    }

    match signal::kill(target, sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(source) => Err(SupervisorError::SignalError {
            process: process.to_string(),
            source,
        }),
    }
}
