use super::host::send_command;
use crate::channel::CONTROL_READ_TIMEOUT;
use crate::command_server::Controller;
use crate::config::HostConfig;
use crate::protocol::{Command, Reply, DEFAULT_RUN};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

/// Starts and stops the whole platform by relaying commands to every daemon.
pub struct PlatformController {
    hosts: Vec<HostConfig>,
    run: Mutex<String>,
    timeout: Duration,
}

impl PlatformController {
    pub fn new(hosts: Vec<HostConfig>) -> Self {
        Self {
            hosts,
            run: Mutex::new(DEFAULT_RUN.to_string()),
            timeout: CONTROL_READ_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run id of the last `START`.
    pub fn current_run(&self) -> String {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn broadcast(&self, command: Command) -> bool {
        if self.hosts.is_empty() {
            warn!("No daemon configured, nothing to '{}'", command);
            return false;
        }

        let mut all_ok = true;
        for host in &self.hosts {
            match send_command(host.command_addr(), &command, self.timeout).await {
                Ok(Reply::Ok) => info!(host = %host.name, "'{}' done", command),
                Ok(reply) => {
                    error!(host = %host.name, "'{}' answered with '{}'", command, reply);
                    all_ok = false;
                }
                Err(e) => {
                    error!(host = %host.name, "Cannot send '{}': {}", command, e);
                    all_ok = false;
                }
            }
        }
        all_ok
    }
}

impl Controller for PlatformController {
    async fn start(&self, run: &str) -> anyhow::Result<bool> {
        *self.run.lock().unwrap_or_else(PoisonError::into_inner) = run.to_string();
        Ok(self.broadcast(Command::Start(run.to_string())).await)
    }

    async fn stop(&self) -> anyhow::Result<bool> {
        Ok(self.broadcast(Command::Stop).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// Fake daemon command server answering every line with `reply`.
    async fn fake_daemon(name: &str, reply: &'static str) -> HostConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (mut reader, mut writer) = channel::split(stream);
                if reader.read_line_timeout(Duration::from_secs(5)).await.is_ok() {
                    writer.write_line(reply).await.unwrap();
                }
            }
        });
        HostConfig {
            name: name.into(),
            address: addr.ip(),
            state_port: addr.port(),
            command_port: addr.port(),
        }
    }

    #[tokio::test]
    async fn test_start_succeeds_when_every_daemon_agrees() {
        let hosts = vec![fake_daemon("gw", "OK").await, fake_daemon("sat", "OK").await];
        let controller = PlatformController::new(hosts);

        assert!(controller.start("scenario_A").await.unwrap());
        assert_eq!(controller.current_run(), "scenario_A");
        assert!(controller.stop().await.unwrap());
    }

    #[tokio::test]
    async fn test_one_refusing_daemon_fails_the_command() {
        let hosts = vec![fake_daemon("gw", "OK").await, fake_daemon("sat", "ERROR").await];
        let controller = PlatformController::new(hosts);
        assert!(!controller.start("scenario_A").await.unwrap());
    }

    #[tokio::test]
    async fn test_no_daemon_is_a_refusal() {
        let controller = PlatformController::new(Vec::new());
        assert_eq!(controller.current_run(), DEFAULT_RUN);
        assert!(!controller.stop().await.unwrap());
    }
}
