use super::supervisor::ProcessSupervisor;
use crate::command_server::Controller;
use std::sync::Arc;
use tracing::info;

/// Drives the local supervisor from `START`/`STOP` requests.
pub struct SupervisorController {
    supervisor: Arc<ProcessSupervisor>,
}

impl SupervisorController {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

impl Controller for SupervisorController {
    async fn start(&self, run: &str) -> anyhow::Result<bool> {
        info!("Starting every process for run '{}'", run);
        self.supervisor.start_all().await?;
        self.supervisor.serialize().await?;
        Ok(true)
    }

    async fn stop(&self) -> anyhow::Result<bool> {
        self.supervisor.stop_all().await;
        self.supervisor.serialize().await?;
        Ok(true)
    }
}
