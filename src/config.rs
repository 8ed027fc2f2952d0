//! Configuration loading for dpsup.
//!
//! Descriptors reach the supervisor through a [`DescriptorSource`]. The YAML source expands
//! environment references, resolves relative paths against the config file's directory and
//! fills unset probe/stop settings from the `supervisor` section.
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use regex::{Captures, Regex};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_TIMEOUT,
    DEFAULT_STOP_GRACE_PERIOD, DEFAULT_TEARDOWN_TIMEOUT,
};
use crate::descriptor::{
    Backoff, ProbeConfig, ProbeMethod, ProcessDescriptor, RestartMode, RestartPolicy,
};
use crate::error::SupervisorError;

/// Supervisor-wide settings that are not part of any one descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Upper bound on how long `close` waits for every process to stop.
    pub teardown_timeout: Duration,
    /// Where to write JSON status snapshots, if anywhere.
    pub status_file: Option<PathBuf>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
            status_file: None,
        }
    }
}

/// Everything a supervisor needs to start.
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    pub settings: SupervisorSettings,
    pub processes: Vec<ProcessDescriptor>,
}

/// Supplies process descriptors to the supervisor.
pub trait DescriptorSource: Send {
    fn load(&self) -> Result<SupervisorConfig, SupervisorError>;

    /// Human-readable origin used in log messages.
    fn describe(&self) -> String {
        "descriptor source".to_string()
    }
}

/// In-memory descriptors, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    config: SupervisorConfig,
}

impl StaticSource {
    pub fn new(processes: Vec<ProcessDescriptor>) -> Self {
        Self {
            config: SupervisorConfig {
                settings: SupervisorSettings::default(),
                processes,
            },
        }
    }

    pub fn with_settings(mut self, settings: SupervisorSettings) -> Self {
        self.config.settings = settings;
        self
    }
}

impl DescriptorSource for StaticSource {
    fn load(&self) -> Result<SupervisorConfig, SupervisorError> {
        Ok(self.config.clone())
    }

    fn describe(&self) -> String {
        format!("{} static descriptors", self.config.processes.len())
    }
}

/// Descriptors read from a YAML file.
#[derive(Debug, Clone)]
pub struct YamlConfigSource {
    path: PathBuf,
}

impl YamlConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DescriptorSource for YamlConfigSource {
    fn load(&self) -> Result<SupervisorConfig, SupervisorError> {
        load_config(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Represents environment variables for a process.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct EnvConfig {
    /// Optional path to a `KEY=VALUE` file.
    pub file: Option<String>,
    /// Inline variables; these win over entries from `file`.
    pub vars: Option<BTreeMap<String, String>>,
}

impl EnvConfig {
    /// Resolves the env file path against `base` when it is relative.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|file| resolve_path(base, file))
    }
}

/// A duration written either as a bare number of seconds or as `<n>ms|s|m|h`.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    fn resolve(&self, process: &str, field: &str) -> Result<Duration, SupervisorError> {
        match self {
            DurationValue::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            DurationValue::Text(raw) => parse_duration(raw).map_err(|reason| {
                SupervisorError::invalid(process, format!("{field}: {reason}"))
            }),
        }
    }
}

fn resolve_opt(
    value: &Option<DurationValue>,
    process: &str,
    field: &str,
) -> Result<Option<Duration>, SupervisorError> {
    value
        .as_ref()
        .map(|value| value.resolve(process, field))
        .transpose()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[allow(dead_code)]
    version: String,
    #[serde(default)]
    supervisor: RawSettings,
    #[serde(default)]
    processes: BTreeMap<String, RawProcess>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawSettings {
    probe_interval: Option<DurationValue>,
    probe_timeout: Option<DurationValue>,
    failure_threshold: Option<u32>,
    stop_grace_period: Option<DurationValue>,
    teardown_timeout: Option<DurationValue>,
    status_file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProcess {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    env: Option<EnvConfig>,
    working_dir: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    readiness: Option<RawReadiness>,
    restart: Option<RawRestart>,
    stop_grace_period: Option<DurationValue>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawReadiness {
    method: Option<String>,
    target: Option<String>,
    interval: Option<DurationValue>,
    timeout: Option<DurationValue>,
    failure_threshold: Option<u32>,
    kill_after: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawRestart {
    mode: Option<RestartMode>,
    max_failures: Option<MaxFailures>,
    backoff: Option<RawBackoff>,
    reset_after: Option<DurationValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MaxFailures {
    Count(u32),
    Keyword(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBackoff {
    Schedule(Vec<DurationValue>),
    Exponential {
        initial: DurationValue,
        max: DurationValue,
        multiplier: Option<u32>,
    },
    Fixed(DurationValue),
}

/// Probe timing defaults taken from the `supervisor` section.
struct Defaults {
    probe_interval: Duration,
    probe_timeout: Duration,
    failure_threshold: u32,
    stop_grace_period: Duration,
}

/// Parses a duration in the format `<number>[ms|s|m|h]`; a bare number means seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let value = raw.trim();
    if value.is_empty() {
        return Err("duration value cannot be empty".to_string());
    }

    let (amount_str, unit_ms) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1_000)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60_000)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3_600_000)
    } else {
        (value, 1_000)
    };

    let amount: u64 = amount_str
        .parse()
        .map_err(|_| format!("invalid duration value: '{raw}'"))?;
    Ok(Duration::from_millis(amount.saturating_mul(unit_ms)))
}

/// Expands `${VAR}` and `$VAR` from the process environment. `$$` yields a literal `$`.
fn expand_env_vars(input: &str) -> Result<String, SupervisorError> {
    let re = Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .map_err(|err| SupervisorError::invalid("config", err.to_string()))?;

    let mut missing = Vec::new();
    let expanded = re.replace_all(input, |caps: &Captures| {
        let Some(name) = caps.get(1).or_else(|| caps.get(2)) else {
            return "$".to_string();
        };
        match env::var(name.as_str()) {
            Ok(value) => value,
            Err(_) => {
                missing.push(name.as_str().to_string());
                String::new()
            }
        }
    });

    if let Some(name) = missing.first() {
        return Err(SupervisorError::invalid(
            "config",
            format!("missing environment variable: {name}"),
        ));
    }
    Ok(expanded.into_owned())
}

fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Builds the environment overlay for a process, giving inline `env.vars` precedence over
/// entries loaded from `env.file`.
fn collect_env(
    env: Option<&EnvConfig>,
    base: &Path,
    process: &str,
) -> Result<BTreeMap<String, String>, SupervisorError> {
    let mut resolved = BTreeMap::new();
    let Some(env_config) = env else {
        return Ok(resolved);
    };

    if let Some(file_path) = env_config.path(base) {
        let content = fs::read_to_string(&file_path).map_err(|err| {
            SupervisorError::invalid(
                process,
                format!("cannot read env file {}: {err}", file_path.display()),
            )
        })?;

        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().to_string();
                let mut value = value.trim();
                if value.len() >= 2
                    && ((value.starts_with('"') && value.ends_with('"'))
                        || (value.starts_with('\'') && value.ends_with('\'')))
                {
                    value = &value[1..value.len() - 1];
                }
                resolved.insert(key, value.to_string());
            } else {
                warn!("Ignoring malformed line in env file for '{process}': {line}");
            }
        }
    }

    if let Some(vars) = &env_config.vars {
        for (key, value) in vars {
            resolved.insert(key.clone(), value.clone());
        }
    }

    Ok(resolved)
}

fn build_probe(
    name: &str,
    raw: Option<RawReadiness>,
    defaults: &Defaults,
    base: &Path,
) -> Result<ProbeConfig, SupervisorError> {
    let raw = raw.unwrap_or_default();
    let method_name = raw.method.as_deref().unwrap_or("liveness");

    let target = |what: &str| {
        raw.target.clone().ok_or_else(|| {
            SupervisorError::invalid(
                name,
                format!("readiness method '{method_name}' requires a target ({what})"),
            )
        })
    };

    let method = match method_name {
        "liveness" => ProbeMethod::Liveness,
        "file" => ProbeMethod::File(resolve_path(base, &target("path")?)),
        "tcp" => ProbeMethod::Tcp(target("host:port")?),
        "http" => ProbeMethod::Http(target("url")?),
        "command" => ProbeMethod::Command(target("shell command")?),
        "custom" => ProbeMethod::Custom(target("registered probe name")?),
        other => {
            return Err(SupervisorError::invalid(
                name,
                format!("unknown readiness method '{other}'"),
            ));
        }
    };

    Ok(ProbeConfig {
        method,
        interval: resolve_opt(&raw.interval, name, "readiness.interval")?
            .unwrap_or(defaults.probe_interval),
        timeout: resolve_opt(&raw.timeout, name, "readiness.timeout")?
            .unwrap_or(defaults.probe_timeout),
        failure_threshold: raw.failure_threshold.unwrap_or(defaults.failure_threshold),
        kill_after: raw.kill_after,
    })
}

fn build_restart(name: &str, raw: Option<RawRestart>) -> Result<RestartPolicy, SupervisorError> {
    let defaults = RestartPolicy::default();
    let Some(raw) = raw else {
        return Ok(defaults);
    };

    let max_failures = match raw.max_failures {
        None => defaults.max_failures,
        Some(MaxFailures::Count(count)) => Some(count),
        Some(MaxFailures::Keyword(keyword)) if keyword == "unlimited" => None,
        Some(MaxFailures::Keyword(keyword)) => {
            return Err(SupervisorError::invalid(
                name,
                format!("max_failures must be a number or 'unlimited', got '{keyword}'"),
            ));
        }
    };

    let backoff = match raw.backoff {
        None => defaults.backoff,
        Some(RawBackoff::Fixed(delay)) => Backoff::Fixed(delay.resolve(name, "backoff")?),
        Some(RawBackoff::Schedule(delays)) => Backoff::Schedule(
            delays
                .iter()
                .map(|delay| delay.resolve(name, "backoff"))
                .collect::<Result<_, _>>()?,
        ),
        Some(RawBackoff::Exponential {
            initial,
            max,
            multiplier,
        }) => Backoff::Exponential {
            initial: initial.resolve(name, "backoff.initial")?,
            max: max.resolve(name, "backoff.max")?,
            multiplier: multiplier.unwrap_or(2),
        },
    };

    Ok(RestartPolicy {
        mode: raw.mode.unwrap_or(defaults.mode),
        max_failures,
        backoff,
        reset_after: resolve_opt(&raw.reset_after, name, "reset_after")?
            .unwrap_or(defaults.reset_after),
    })
}

/// Parses YAML `content`; relative paths resolve against `base`.
pub fn parse_config(content: &str, base: &Path) -> Result<SupervisorConfig, SupervisorError> {
    let expanded = expand_env_vars(content)?;
    let raw: RawConfig = serde_yaml::from_str(&expanded)?;

    let defaults = Defaults {
        probe_interval: resolve_opt(&raw.supervisor.probe_interval, "supervisor", "probe_interval")?
            .unwrap_or(DEFAULT_PROBE_INTERVAL),
        probe_timeout: resolve_opt(&raw.supervisor.probe_timeout, "supervisor", "probe_timeout")?
            .unwrap_or(DEFAULT_PROBE_TIMEOUT),
        failure_threshold: raw
            .supervisor
            .failure_threshold
            .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
        stop_grace_period: resolve_opt(
            &raw.supervisor.stop_grace_period,
            "supervisor",
            "stop_grace_period",
        )?
        .unwrap_or(DEFAULT_STOP_GRACE_PERIOD),
    };

    let settings = SupervisorSettings {
        teardown_timeout: resolve_opt(
            &raw.supervisor.teardown_timeout,
            "supervisor",
            "teardown_timeout",
        )?
        .unwrap_or(DEFAULT_TEARDOWN_TIMEOUT),
        status_file: raw
            .supervisor
            .status_file
            .as_deref()
            .map(|file| resolve_path(base, file)),
    };

    let mut processes = Vec::with_capacity(raw.processes.len());
    for (name, process) in raw.processes {
        let env = collect_env(process.env.as_ref(), base, &name)?;
        let working_dir = process
            .working_dir
            .as_deref()
            .map(|dir| resolve_path(base, dir))
            .unwrap_or_else(|| base.to_path_buf());

        let descriptor = if process.args.is_empty() {
            ProcessDescriptor::shell(name.clone(), process.command)
        } else {
            ProcessDescriptor::new(name.clone(), process.command).with_args(process.args)
        };

        let mut descriptor = descriptor
            .with_working_dir(working_dir)
            .depends_on(process.depends_on)
            .with_probe(build_probe(&name, process.readiness, &defaults, base)?)
            .with_restart(build_restart(&name, process.restart)?)
            .with_stop_grace_period(
                resolve_opt(&process.stop_grace_period, &name, "stop_grace_period")?
                    .unwrap_or(defaults.stop_grace_period),
            );
        descriptor.env = env;
        descriptor.validate()?;
        processes.push(descriptor);
    }

    Ok(SupervisorConfig {
        settings,
        processes,
    })
}

/// Loads and parses the configuration file at `path`.
pub fn load_config(path: impl AsRef<Path>) -> Result<SupervisorConfig, SupervisorError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        SupervisorError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })?;

    let base = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let base = base.canonicalize().unwrap_or(base);

    let config = parse_config(&content, &base)?;
    debug!(
        "Loaded {} process descriptors from {}",
        config.processes.len(),
        path.display()
    );
    Ok(config)
}
