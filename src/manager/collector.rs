//! UDP probe ingestion.

use super::events::{EventSender, ManagerEvent};
use super::probe::ProbeRecord;
use super::series::ProbeStore;
use crate::error::ProbeError;
use crate::stop::StopFlag;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

const RECV_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 1024;

pub struct ProbeListener {
    socket: UdpSocket,
}

impl ProbeListener {
    /// Bind the probe port. A failure is logged once and yields `None`:
    /// the manager then runs without probes.
    pub async fn bind(addr: SocketAddr) -> Option<Self> {
        match UdpSocket::bind(addr).await {
            Ok(socket) => {
                info!("Probe listener bound on {}", addr);
                Some(Self { socket })
            }
            Err(e) => {
                error!("Cannot bind probe listener on {}: {}", addr, e);
                None
            }
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive datagrams until `stop` is set. Malformed datagrams are skipped;
    /// a socket error ends the loop and is reported as an event.
    pub async fn run(
        self,
        stop: StopFlag,
        store: Arc<ProbeStore>,
        events: EventSender,
    ) -> std::io::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM];

        while !stop.is_set() {
            let received = tokio::time::timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf)).await;
            let (len, peer) = match received {
                Err(_) => continue,
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    error!("Probe listener stopped: {}", e);
                    let _ = events
                        .send(ManagerEvent::Error(format!("probe listener stopped: {e}")))
                        .await;
                    return Err(e);
                }
            };

            let record = match ProbeRecord::decode(&buf[..len]) {
                Ok(record) => record,
                Err(e @ ProbeError::Short { .. }) => {
                    warn!("Datagram from {} rejected: {}", peer, e);
                    continue;
                }
                Err(e) => {
                    debug!("Datagram from {} dropped: {}", peer, e);
                    continue;
                }
            };

            if !store.append(&record) {
                continue;
            }
            let name = store
                .probe_name(&record.component.to_string(), record.stat_id)
                .unwrap_or_default();
            if events
                .send(ManagerEvent::ProbeSample { name, record })
                .await
                .is_err()
            {
                debug!("No event consumer left, stopping probe listener");
                break;
            }
        }

        debug!("Probe listener stopped");
        Ok(())
    }
}
