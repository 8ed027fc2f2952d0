use std::{error::Error, sync::mpsc};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dpsup::{
    cli::{Cli, Commands, parse_args},
    config::YamlConfigSource,
    status::{load_snapshot, render_table},
    supervisor::{Plugin, Supervisor},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Run { config } => run_foreground(&config)?,
        Commands::Check { config } => check_config(&config)?,
        Commands::Status {
            file,
            process,
            json,
        } => show_status(&file, process.as_deref(), json)?,
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn run_foreground(config_path: &str) -> Result<(), Box<dyn Error>> {
    let interrupted = register_signal_handler()?;

    let mut supervisor = Supervisor::new(YamlConfigSource::new(config_path));
    supervisor.init()?;
    supervisor.after_init()?;
    info!("dpsup supervising {} processes", supervisor.start_order().len());

    let _ = interrupted.recv();
    if let Err(err) = supervisor.close() {
        error!("Shutdown did not complete cleanly: {err}");
        return Err(err.into());
    }
    Ok(())
}

fn check_config(config_path: &str) -> Result<(), Box<dyn Error>> {
    let mut supervisor = Supervisor::new(YamlConfigSource::new(config_path));
    if let Err(err) = supervisor.init() {
        eprintln!("Configuration invalid: {err}");
        return Err(err.into());
    }

    println!(
        "Configuration OK: {} processes",
        supervisor.start_order().len()
    );
    println!("Start order: {}", supervisor.start_order().join(" -> "));
    supervisor.close()?;
    Ok(())
}

fn show_status(file: &str, process: Option<&str>, json: bool) -> Result<(), Box<dyn Error>> {
    let mut snapshot = load_snapshot(file)?;
    if let Some(name) = process {
        snapshot.processes.retain(|entry| entry.name == name);
        if snapshot.processes.is_empty() {
            return Err(format!("process '{name}' not found in {file}").into());
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", render_table(&snapshot));
    }
    Ok(())
}

/// Routes SIGINT and SIGTERM into a channel so teardown runs on the main thread.
fn register_signal_handler() -> Result<mpsc::Receiver<()>, Box<dyn Error>> {
    let (sender, receiver) = mpsc::channel();
    ctrlc::set_handler(move || {
        info!("dpsup is shutting down; stopping supervised processes");
        let _ = sender.send(());
    })?;

    Ok(receiver)
}
