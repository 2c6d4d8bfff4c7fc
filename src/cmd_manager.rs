use crate::args::ManagerCommands;
use anyhow::Result;
use sand_control::clienv;
use sand_control::config::ManagerConfig;
use sand_control::manager::ManagerServer;
use std::path::PathBuf;

pub async fn cmd_manager(command: ManagerCommands) -> Result<()> {
    match command {
        ManagerCommands::Run { config } => cmd_manager_run(config).await,
    }
}

async fn cmd_manager_run(config: Option<PathBuf>) -> Result<()> {
    let path = config.unwrap_or_else(clienv::manager_config_path);
    let config = ManagerConfig::load(&path)?;

    println!("Running manager in foreground (Ctrl+C to stop)");
    println!("  Command server: {}", config.command_addr());
    println!("  Probe port:     {}", config.probe_addr());
    for host in &config.hosts {
        println!("  Host {:<10} {}", host.name, host.address);
    }
    println!();

    ManagerServer::new(config).run().await
}
