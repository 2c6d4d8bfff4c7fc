use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sand")]
#[command(version)]
#[command(about = "Control plane of the satellite emulation testbed", long_about = None)]
pub(crate) struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Host daemon supervising the emulated entities of this host
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },

    /// Platform manager core
    Manager {
        #[command(subcommand)]
        command: ManagerCommands,
    },

    /// Send one control command to a daemon or manager
    Ctl {
        /// Command server address (e.g. 192.168.1.10:3142)
        addr: SocketAddr,

        #[command(subcommand)]
        command: CtlCommands,
    },
}

#[derive(Subcommand)]
pub(crate) enum DaemonCommands {
    /// Run the daemon in the foreground
    Run {
        /// Configuration file (default: $SAND_DAEMON_CONFIG or <config dir>/daemon.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the persisted process state
    Status {
        /// Process state file (default: $SAND_STATE_FILE)
        #[arg(long)]
        state_file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub(crate) enum ManagerCommands {
    /// Run the manager in the foreground
    Run {
        /// Configuration file (default: $SAND_MANAGER_CONFIG or <config dir>/manager.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub(crate) enum CtlCommands {
    /// Start the platform
    Start {
        /// Run identifier
        run: Option<String>,
    },

    /// Stop the platform
    Stop,

    /// Send a raw protocol line
    Raw {
        line: String,
    },
}
