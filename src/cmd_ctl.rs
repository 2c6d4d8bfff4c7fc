use crate::args::CtlCommands;
use anyhow::Result;
use sand_control::channel::CONTROL_READ_TIMEOUT;
use sand_control::manager::send_command;
use sand_control::protocol::{Command, Reply, DEFAULT_RUN};
use std::net::SocketAddr;

pub async fn cmd_ctl(addr: SocketAddr, command: CtlCommands) -> Result<()> {
    let command = match command {
        CtlCommands::Start { run } => Command::Start(run.unwrap_or_else(|| DEFAULT_RUN.into())),
        CtlCommands::Stop => Command::Stop,
        CtlCommands::Raw { line } => Command::parse(&line),
    };

    let reply = send_command(addr, &command, CONTROL_READ_TIMEOUT).await?;
    println!("{}", reply);
    match reply {
        Reply::Error(_) => anyhow::bail!("'{}' failed on {}", command, addr),
        _ => Ok(()),
    }
}
