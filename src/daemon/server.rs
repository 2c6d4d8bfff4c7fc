use super::controller::SupervisorController;
use super::state_server::{StateServer, StateServerConfig};
use super::supervisor::ProcessSupervisor;
use crate::channel;
use crate::command_server::CommandServer;
use crate::config::DaemonConfig;
use crate::stop::StopFlag;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub struct DaemonServer {
    config: DaemonConfig,
    supervisor: Arc<ProcessSupervisor>,
    shutdown: StopFlag,
}

impl DaemonServer {
    pub fn new(config: DaemonConfig) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.processes.clone(),
            config.state_file.clone(),
        ));
        Self {
            config,
            supervisor,
            shutdown: StopFlag::new(),
        }
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Flag that stops the daemon when set.
    pub fn shutdown_flag(&self) -> StopFlag {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        info!("Daemon '{}' starting...", self.config.host_name());

        // Processes left over by a previous daemon are killed before any
        // manager connects.
        self.supervisor.reset().await;

        let state_listener = channel::listen(self.config.state_addr()).await?;
        let command_listener = channel::listen(self.config.command_addr()).await?;

        let state_server = Arc::new(StateServer::new(
            Arc::clone(&self.supervisor),
            StateServerConfig::default(),
        ));
        let command_server = Arc::new(CommandServer::new(Arc::new(SupervisorController::new(
            Arc::clone(&self.supervisor),
        ))));

        self.shutdown.set_on_signal()?;

        let state_task = tokio::spawn(state_server.serve(state_listener, self.shutdown.clone()));
        let command_task =
            tokio::spawn(command_server.serve(command_listener, self.shutdown.clone()));
        info!("Daemon ready");

        self.shutdown.wait().await;
        info!("Shutdown signal received");

        for (name, task) in [("state", state_task), ("command", command_task)] {
            if let Err(e) = task.await {
                warn!("{} server task failed: {}", name, e);
            }
        }

        info!("Stopping all processes...");
        self.supervisor.stop_all().await;
        if let Err(e) = self.supervisor.serialize().await {
            warn!("Cannot save process state: {}", e);
        }

        info!("Daemon stopped");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ProcessDefinition;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_daemon_serves_both_channels_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            role: "sat".into(),
            instance: None,
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            state_port: free_port(),
            command_port: free_port(),
            state_file: dir.path().join("process.json"),
            processes: vec![ProcessDefinition::new("sat", "sleep").args(["30"])],
        };
        let command_addr = config.command_addr();
        let state_addr = config.state_addr();

        let server = DaemonServer::new(config);
        let supervisor = Arc::clone(server.supervisor());
        let shutdown = server.shutdown_flag();
        let daemon = tokio::spawn(server.run());

        let wait = Duration::from_secs(5);
        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = TcpStream::connect(command_addr).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let (mut reader, mut writer) = channel::split(stream.unwrap());
        writer.write_line("START").await.unwrap();
        assert_eq!(reader.read_line_timeout(wait).await.unwrap(), "OK");
        assert!(supervisor.get_components().await.contains("sat"));

        let state = TcpStream::connect(state_addr).await;
        assert!(state.is_ok());

        shutdown.set();
        daemon.await.unwrap().unwrap();
        assert!(supervisor.get_components().await.is_empty());
    }
}
