use super::collector::ProbeListener;
use super::controller::PlatformController;
use super::events::{self, EventReceiver, ManagerEvent};
use super::host::HostWatcher;
use super::series::ProbeStore;
use crate::channel;
use crate::command_server::CommandServer;
use crate::config::ManagerConfig;
use crate::stop::StopFlag;
use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub struct ManagerServer {
    config: ManagerConfig,
    store: Arc<ProbeStore>,
    shutdown: StopFlag,
}

impl ManagerServer {
    pub fn new(config: ManagerConfig) -> Self {
        let store = Arc::new(ProbeStore::new(&config.probes));
        Self {
            config,
            store,
            shutdown: StopFlag::new(),
        }
    }

    pub fn store(&self) -> &Arc<ProbeStore> {
        &self.store
    }

    pub fn shutdown_flag(&self) -> StopFlag {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        info!("Manager starting with {} host(s)", self.config.hosts.len());

        let (tx, rx) = events::channel();
        let mut tasks = JoinSet::new();

        let command_listener = channel::listen(self.config.command_addr()).await?;
        let controller = Arc::new(PlatformController::new(self.config.hosts.clone()));
        let command_server = Arc::new(CommandServer::new(controller));
        tasks.spawn(command_server.serve(command_listener, self.shutdown.clone()));

        match ProbeListener::bind(self.config.probe_addr()).await {
            Some(listener) => {
                let stop = self.shutdown.clone();
                let store = Arc::clone(&self.store);
                let tx = tx.clone();
                tasks.spawn(async move {
                    if let Err(e) = listener.run(stop, store, tx).await {
                        error!("Probe ingestion ended: {}", e);
                    }
                });
            }
            None => warn!("Probes are disabled"),
        }

        for host in &self.config.hosts {
            let watcher = HostWatcher::new(host.clone(), tx.clone());
            let (stop, name) = (self.shutdown.clone(), host.name.clone());
            tasks.spawn(async move {
                if let Err(e) = watcher.run(stop).await {
                    error!(host = %name, "Host watcher ended: {}", e);
                }
            });
        }
        drop(tx);

        self.shutdown.set_on_signal()?;
        let reporter = tokio::spawn(report_events(rx));
        info!("Manager ready");

        self.shutdown.wait().await;
        info!("Shutdown signal received");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Manager task failed: {}", e);
            }
        }
        if let Err(e) = reporter.await {
            warn!("Event reporter failed: {}", e);
        }

        info!("Manager stopped");
        Ok(())
    }
}

/// Log every event; the CLI is the front-end.
async fn report_events(mut rx: EventReceiver) {
    while let Some(event) = rx.recv().await {
        match event {
            ManagerEvent::HostState { host, components } => {
                let names: Vec<&str> = components.iter().collect();
                info!(host = %host, "Running components: [{}]", names.join(", "));
            }
            ManagerEvent::HostUnreachable { host, reason } => {
                warn!(host = %host, "Host unreachable: {}", reason)
            }
            ManagerEvent::ProbeSample { name, record } => {
                debug!(
                    component = %record.component,
                    stat = record.stat_id,
                    "Probe {}: {:?}",
                    name,
                    record.sample
                )
            }
            ManagerEvent::Error(message) => error!("{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeConfig;

    #[test]
    fn test_store_is_built_from_probe_config() {
        let config = ManagerConfig {
            probes: vec![ProbeConfig {
                component: "GW".into(),
                stat_id: 1,
                name: "throughput".into(),
                indexes: 3,
            }],
            ..Default::default()
        };
        let server = ManagerServer::new(config);
        assert_eq!(server.store().len(), 1);
        assert!(server.store().series("GW", 1, 3).is_some());
        assert!(server.store().series("GW", 1, 4).is_none());
    }

    #[tokio::test]
    async fn test_manager_stops_on_shutdown() {
        let config = ManagerConfig {
            bind: "127.0.0.1".parse().unwrap(),
            command_port: 0,
            probe_port: 0,
            ..Default::default()
        };
        let server = ManagerServer::new(config);
        let shutdown = server.shutdown_flag();
        let manager = tokio::spawn(server.run());

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        shutdown.set();
        tokio::time::timeout(std::time::Duration::from_secs(5), manager)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
