//! Manager-side clients of a daemon.

use super::events::{EventSender, ManagerEvent};
use crate::channel::{self, CONTROL_READ_TIMEOUT};
use crate::config::HostConfig;
use crate::error::{ChannelError, ControlError, Result};
use crate::protocol::{Command, Reply};
use crate::stop::StopFlag;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(ChannelError::Timeout(timeout).into()),
    }
}

/// Send one command line and wait (bounded) for its reply.
pub async fn send_command(addr: SocketAddr, command: &Command, timeout: Duration) -> Result<Reply> {
    let (mut reader, mut writer) = channel::split(connect(addr, timeout).await?);
    debug!("Sending '{}' to {}", command, addr);
    writer.write_line(&command.to_string()).await?;

    let line = reader.read_line_timeout(timeout).await?;
    debug!("Received '{}' from {}", line, addr);
    let _ = writer.finish().await;
    Reply::parse(&line).ok_or(ControlError::Protocol(line))
}

/// Subscribes to one daemon's component list.
pub struct HostWatcher {
    host: HostConfig,
    events: EventSender,
    read_timeout: Duration,
}

impl HostWatcher {
    pub fn new(host: HostConfig, events: EventSender) -> Self {
        Self {
            host,
            events,
            read_timeout: CONTROL_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    async fn emit(&self, event: ManagerEvent) {
        if self.events.send(event).await.is_err() {
            debug!(host = %self.host.name, "Event receiver dropped");
        }
    }

    /// Stream `STARTED` pushes as events until `stop` is set, then end the
    /// subscription with `BYE`. Succeeds only if the daemon acknowledges it.
    pub async fn run(self, stop: StopFlag) -> Result<()> {
        let result = self.watch(&stop).await;
        if let Err(e) = &result {
            warn!(host = %self.host.name, "State subscription failed: {}", e);
            self.emit(ManagerEvent::HostUnreachable {
                host: self.host.name.clone(),
                reason: e.to_string(),
            })
            .await;
        }
        result
    }

    async fn watch(&self, stop: &StopFlag) -> Result<()> {
        let addr = self.host.state_addr();
        let (mut reader, mut writer) = channel::split(connect(addr, self.read_timeout).await?);
        info!(host = %self.host.name, "Connected to daemon state server {}", addr);
        writer.write_line(&Command::State.to_string()).await?;

        while let Some(line) = reader.read_line_cancellable(stop).await? {
            match Reply::parse(&line) {
                Some(Reply::Started(components)) => {
                    debug!(host = %self.host.name, "Components: {}", line);
                    self.emit(ManagerEvent::HostState {
                        host: self.host.name.clone(),
                        components,
                    })
                    .await;
                }
                Some(Reply::Error(detail)) => {
                    let detail = detail.unwrap_or_default();
                    error!(host = %self.host.name, "Daemon error: {}", detail);
                    self.emit(ManagerEvent::Error(format!("{}: {}", self.host.name, detail)))
                        .await;
                }
                _ => warn!(host = %self.host.name, "Unexpected line '{}'", line),
            }
        }

        info!(host = %self.host.name, "Ending state subscription");
        writer.write_line(&Command::Bye.to_string()).await?;
        loop {
            let line = reader.read_line_timeout(self.read_timeout).await?;
            match Reply::parse(&line) {
                Some(Reply::Ok) => break,
                // A push may cross our BYE on the wire.
                Some(Reply::Started(_)) => continue,
                _ => return Err(ControlError::Protocol(line)),
            }
        }
        let _ = writer.finish().await;
        debug!(host = %self.host.name, "Daemon acknowledged BYE");
        Ok(())
    }
}
