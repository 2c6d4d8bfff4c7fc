use crate::args::DaemonCommands;
use anyhow::{Context, Result};
use sand_control::clienv;
use sand_control::config::DaemonConfig;
use sand_control::daemon::supervisor::pid_alive;
use sand_control::daemon::{DaemonServer, PersistedState};
use std::path::PathBuf;

pub async fn cmd_daemon(command: DaemonCommands) -> Result<()> {
    match command {
        DaemonCommands::Run { config } => cmd_daemon_run(config).await,
        DaemonCommands::Status { state_file } => cmd_daemon_status(state_file),
    }
}

async fn cmd_daemon_run(config: Option<PathBuf>) -> Result<()> {
    let path = config.unwrap_or_else(clienv::daemon_config_path);
    let config = DaemonConfig::load(&path)?;

    println!("Running daemon '{}' in foreground (Ctrl+C to stop)", config.host_name());
    println!("  State server:   {}", config.state_addr());
    println!("  Command server: {}", config.command_addr());
    println!("  State file:     {}", config.state_file.display());
    println!();

    DaemonServer::new(config).run().await
}

fn cmd_daemon_status(state_file: Option<PathBuf>) -> Result<()> {
    let path = state_file.unwrap_or_else(clienv::state_file_path);
    let state = PersistedState::read(&path)
        .with_context(|| format!("Cannot read process state from {}", path.display()))?;

    let Some(state) = state else {
        println!("No process state recorded in {}", path.display());
        return Ok(());
    };

    println!("{:<12} {:<8} {:<8} {}", "PROCESS", "STATE", "PID", "ALIVE");
    for (name, process) in &state.processes {
        let pid = process.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let alive = match process.pid {
            Some(pid) if pid_alive(pid) => "yes",
            Some(_) => "no",
            None => "-",
        };
        println!("{:<12} {:<8} {:<8} {}", name, process.state.as_str(), pid, alive);
    }
    Ok(())
}
