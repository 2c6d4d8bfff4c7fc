mod args;
mod cmd_ctl;
mod cmd_daemon;
mod cmd_manager;

use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Daemon { command } => cmd_daemon::cmd_daemon(command).await?,
        Commands::Manager { command } => cmd_manager::cmd_manager(command).await?,
        Commands::Ctl { addr, command } => cmd_ctl::cmd_ctl(addr, command).await?,
    }

    Ok(())
}
