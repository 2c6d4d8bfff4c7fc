use super::probe::ProbeRecord;
use crate::protocol::ComponentList;
use tokio::sync::mpsc;

/// Everything the manager core reports to its front-end.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// A daemon pushed its running components
    HostState {
        host: String,
        components: ComponentList,
    },
    HostUnreachable {
        host: String,
        reason: String,
    },
    /// A probe sample routed into the store
    ProbeSample {
        name: String,
        record: ProbeRecord,
    },
    Error(String),
}

pub type EventSender = mpsc::Sender<ManagerEvent>;
pub type EventReceiver = mpsc::Receiver<ManagerEvent>;

pub const EVENT_QUEUE: usize = 256;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_QUEUE)
}
