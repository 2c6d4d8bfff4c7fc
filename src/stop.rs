//! Cooperative stop flag shared between a session and its background tasks.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// A binary event, unset on creation. Clones observe the same flag.
#[derive(Clone, Debug)]
pub struct StopFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl StopFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the flag is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|set| *set).await;
    }

    /// Wait at most `timeout` for the flag; returns whether it is set.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let _ = tokio::time::timeout(timeout, self.wait()).await;
        self.is_set()
    }

    /// Set the flag on SIGTERM or SIGINT (Ctrl+C elsewhere).
    pub fn set_on_signal(&self) -> std::io::Result<()> {
        let flag = self.clone();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                flag.set();
            });
        }

        #[cfg(not(unix))]
        {
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Received Ctrl+C");
                flag.set();
            });
        }

        Ok(())
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_flag_starts_unset() {
        let flag = StopFlag::new();
        assert!(!flag.is_set());
        flag.clone().set();
        assert!(flag.is_set());
    }

    #[tokio::test]
    async fn test_wait_timeout_expires_when_unset() {
        let flag = StopFlag::new();
        assert!(!flag.wait_timeout(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_set_from_other_task() {
        let flag = StopFlag::new();
        let setter = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            setter.set();
        });

        let start = Instant::now();
        assert!(flag.wait_timeout(Duration::from_secs(5)).await);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
