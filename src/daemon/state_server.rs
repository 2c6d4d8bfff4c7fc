//! Component state server.
//!
//! A manager connects, sends `STATE`, and from then on receives a
//! `STARTED <names>` line every time the set of running components changes
//! (the first list is always sent). The subscription ends with `BYE`, which
//! the daemon acknowledges with `OK` once the update task is joined.
//!
//! ```text
//! ACCEPTED -> AWAIT_STATE_CMD -> RUNNING_UPDATES -> AWAIT_BYE -> CLOSED
//! ```

use super::supervisor::ProcessSupervisor;
use crate::channel::{self, TcpLineReader, TcpLineWriter, CONTROL_READ_TIMEOUT};
use crate::error::{ChannelError, ControlError, Result};
use crate::protocol::{Command, ComponentList, Reply};
use crate::stop::StopFlag;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(2);

type SharedWriter = Arc<Mutex<TcpLineWriter>>;

#[derive(Debug, Clone)]
pub struct StateServerConfig {
    /// Bounded wait for the initial `STATE`
    pub read_timeout: Duration,
    /// Pause between two liveness polls
    pub poll_interval: Duration,
    /// Delay before checking that the update task is alive
    pub startup_grace: Duration,
}

impl Default for StateServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: CONTROL_READ_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }
}

/// How the wait for `BYE` ended.
#[derive(Debug, PartialEq, Eq)]
enum ByeOutcome {
    Bye,
    Unexpected(String),
    Closed,
    Shutdown,
}

pub struct StateServer {
    supervisor: Arc<ProcessSupervisor>,
    config: StateServerConfig,
}

impl StateServer {
    pub fn new(supervisor: Arc<ProcessSupervisor>, config: StateServerConfig) -> Self {
        Self { supervisor, config }
    }

    /// Accept managers until `shutdown` is set. A failing session never
    /// takes the listener down. Returns once every session has torn down.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: StopFlag) {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            let shutdown = shutdown.clone();
                            sessions.spawn(async move {
                                server.handle_connection(stream, peer, shutdown).await;
                            });
                        }
                        Err(e) => error!("State server accept error: {}", e),
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("State session failed: {}", e);
                    }
                }
                _ = shutdown.wait() => break,
            }
        }

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("State session failed: {}", e);
            }
        }
        debug!("State server stopped");
    }

    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, shutdown: StopFlag) {
        info!("State server connected to manager: {}", peer.ip());
        self.supervisor.reset().await;

        let (mut reader, writer) = channel::split(stream);
        let writer: SharedWriter = Arc::new(Mutex::new(writer));

        match self.run_session(&mut reader, &writer, &shutdown).await {
            Ok(()) => {}
            Err(ControlError::Channel(ChannelError::Timeout(t))) => {
                error!("No request from {} within {:?}", peer.ip(), t)
            }
            Err(ControlError::Channel(ChannelError::Eof)) => {
                error!("Manager {} closed the state connection", peer.ip())
            }
            Err(e) => error!("State server exception ({})", e),
        }

        self.supervisor.reset().await;
        let mut writer = writer.lock().await;
        if let Err(e) = writer.finish().await {
            debug!("Closing state connection: {}", e);
        }
    }

    async fn run_session(
        &self,
        reader: &mut TcpLineReader,
        writer: &SharedWriter,
        shutdown: &StopFlag,
    ) -> Result<()> {
        let line = tokio::select! {
            read = reader.read_line_timeout(self.config.read_timeout) => read?,
            _ = shutdown.wait() => {
                info!("Daemon is stopping, closing state session");
                return Ok(());
            }
        };
        debug!("Received: '{}'", line);

        match Command::parse(&line) {
            Command::State => {}
            _ => {
                error!("Unknown command '{}'", line);
                let reply = Reply::Error(Some(format!("unknown command '{line}'")));
                writer.lock().await.write_line(&reply.to_string()).await?;
                return Err(ControlError::Protocol(line));
            }
        }

        debug!("Start update task");
        let updates = UpdateTask::spawn(
            Arc::clone(&self.supervisor),
            Arc::clone(writer),
            self.config.poll_interval,
        );

        let outcome = self.await_bye(reader, writer, &updates, shutdown).await;
        updates.shutdown().await;

        match outcome? {
            ByeOutcome::Bye => {
                info!("Manager is stopped");
                writer.lock().await.write_line(&Reply::Ok.to_string()).await?;
            }
            ByeOutcome::Unexpected(line) => error!("'{}' received from manager", line),
            ByeOutcome::Closed => error!("Manager closed the connection without BYE"),
            ByeOutcome::Shutdown => info!("Daemon is stopping, closing state session"),
        }
        Ok(())
    }

    async fn await_bye(
        &self,
        reader: &mut TcpLineReader,
        writer: &SharedWriter,
        updates: &UpdateTask,
        shutdown: &StopFlag,
    ) -> Result<ByeOutcome> {
        tokio::time::sleep(self.config.startup_grace).await;
        if updates.is_finished() {
            error!("Update task is not started correctly");
            let reply = Reply::Error(Some("cannot start update task".into()));
            writer.lock().await.write_line(&reply.to_string()).await?;
        }

        let line = match reader.read_line_cancellable(shutdown).await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(ByeOutcome::Shutdown),
            Err(ChannelError::Eof) => return Ok(ByeOutcome::Closed),
            Err(e) => return Err(e.into()),
        };
        debug!("Received: '{}'", line);

        Ok(match Command::parse(&line) {
            Command::Bye => ByeOutcome::Bye,
            _ => ByeOutcome::Unexpected(line),
        })
    }
}

/// Background differential-update task of one session.
///
/// Dropping the handle sets the stop flag; [`UpdateTask::shutdown`] also
/// joins the task.
struct UpdateTask {
    stop: StopFlag,
    handle: Option<JoinHandle<()>>,
}

impl UpdateTask {
    fn spawn(supervisor: Arc<ProcessSupervisor>, writer: SharedWriter, interval: Duration) -> Self {
        let stop = StopFlag::new();
        let handle = tokio::spawn(run_updates(supervisor, writer, stop.clone(), interval));
        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    async fn shutdown(mut self) {
        debug!("Stop update task");
        self.stop.set();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("Update task failed: {}", e);
            }
        }
        debug!("Update task joined");
    }
}

impl Drop for UpdateTask {
    fn drop(&mut self) {
        self.stop.set();
    }
}

async fn run_updates(
    supervisor: Arc<ProcessSupervisor>,
    writer: SharedWriter,
    stop: StopFlag,
    interval: Duration,
) {
    if let Err(e) = supervisor.load().await {
        error!("Cannot load the process list: {}", e);
        return;
    }

    let mut pushed: Option<ComponentList> = None;
    loop {
        let current = supervisor.get_components().await;
        if pushed.as_ref() != Some(&current) {
            let reply = Reply::Started(current.clone());
            debug!("Component list has changed: {}", reply);
            if let Err(e) = writer.lock().await.write_line(&reply.to_string()).await {
                error!("Cannot send the component list: {}", e);
                break;
            }
            pushed = Some(current);

            if let Err(e) = supervisor.serialize().await {
                error!("Error when serializing process list: stop update task ({})", e);
                stop.set();
                break;
            }
        }

        if stop.wait_timeout(interval).await {
            break;
        }
        supervisor.update(true).await;
    }
    if !stop.is_set() {
        warn!("Update task ended before being asked to");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{LineReader, LineWriter};
    use crate::config::ProcessDefinition;
    use std::time::Instant;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> StateServerConfig {
        StateServerConfig {
            read_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            startup_grace: Duration::from_millis(100),
        }
    }

    async fn spawn_server(
        supervisor: Arc<ProcessSupervisor>,
        config: StateServerConfig,
    ) -> (SocketAddr, StopFlag, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = StopFlag::new();
        let server = Arc::new(StateServer::new(supervisor, config));
        let serve = tokio::spawn(server.serve(listener, shutdown.clone()));
        (addr, shutdown, serve)
    }

    async fn start_server(
        supervisor: Arc<ProcessSupervisor>,
    ) -> (SocketAddr, StopFlag) {
        let (addr, shutdown, _) = spawn_server(supervisor, test_config()).await;
        (addr, shutdown)
    }

    async fn connect(
        addr: SocketAddr,
    ) -> (LineReader<OwnedReadHalf>, LineWriter<OwnedWriteHalf>) {
        channel::split(TcpStream::connect(addr).await.unwrap())
    }

    #[cfg(unix)]
    fn sleeper(name: &str) -> ProcessDefinition {
        ProcessDefinition::new(name, "sleep").args(["30"])
    }

    #[tokio::test]
    async fn test_unknown_first_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(ProcessSupervisor::new(vec![], dir.path().join("p.json")));
        let (addr, shutdown) = start_server(supervisor).await;

        let (mut reader, mut writer) = connect(addr).await;
        writer.write_line("HELLO").await.unwrap();

        let reply = reader.read_line_timeout(WAIT).await.unwrap();
        assert_eq!(reply, "ERROR unknown command 'HELLO'");
        let err = reader.read_line_timeout(WAIT).await.unwrap_err();
        assert!(matches!(err, ChannelError::Eof));
        shutdown.set();
    }

    #[tokio::test]
    async fn test_empty_supervisor_pushes_empty_list_then_acknowledges_bye() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(ProcessSupervisor::new(vec![], dir.path().join("p.json")));
        let (addr, shutdown) = start_server(supervisor).await;

        let (mut reader, mut writer) = connect(addr).await;
        writer.write_line("STATE").await.unwrap();
        assert_eq!(reader.read_line_timeout(WAIT).await.unwrap(), "STARTED");

        writer.write_line("BYE").await.unwrap();
        assert_eq!(reader.read_line_timeout(WAIT).await.unwrap(), "OK");
        shutdown.set();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_component_changes_are_pushed_until_bye() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(
            ProcessSupervisor::new(
                vec![sleeper("gw").autostart(true), sleeper("sat")],
                dir.path().join("process.json"),
            )
            .with_stop_timeout(Duration::from_secs(2)),
        );
        let (addr, shutdown) = start_server(Arc::clone(&supervisor)).await;

        let (mut reader, mut writer) = connect(addr).await;
        writer.write_line("STATE").await.unwrap();
        assert_eq!(reader.read_line_timeout(WAIT).await.unwrap(), "STARTED gw");

        supervisor.start("sat").await.unwrap();
        assert_eq!(
            reader.read_line_timeout(WAIT).await.unwrap(),
            "STARTED gw sat"
        );

        // Unchanged lists are not pushed again.
        let quiet = reader.read_line_timeout(Duration::from_millis(400)).await;
        assert!(matches!(quiet, Err(ChannelError::Timeout(_))));

        let bye_sent = Instant::now();
        writer.write_line("BYE").await.unwrap();
        assert_eq!(reader.read_line_timeout(WAIT).await.unwrap(), "OK");
        assert!(bye_sent.elapsed() < Duration::from_secs(1));

        // Session teardown resets the supervisor.
        let err = reader.read_line_timeout(WAIT).await.unwrap_err();
        assert!(matches!(err, ChannelError::Eof));
        assert!(supervisor.get_components().await.is_empty());
        shutdown.set();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_is_pushed() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(ProcessSupervisor::new(
            vec![
                sleeper("gw").autostart(true),
                ProcessDefinition::new("st1", "sh")
                    .args(["-c", "sleep 0.5"])
                    .autostart(true),
            ],
            dir.path().join("process.json"),
        ));
        let (addr, shutdown) = start_server(supervisor).await;

        let (mut reader, mut writer) = connect(addr).await;
        writer.write_line("STATE").await.unwrap();
        assert_eq!(
            reader.read_line_timeout(WAIT).await.unwrap(),
            "STARTED gw st1"
        );
        assert_eq!(reader.read_line_timeout(WAIT).await.unwrap(), "STARTED gw");

        writer.write_line("BYE").await.unwrap();
        assert_eq!(reader.read_line_timeout(WAIT).await.unwrap(), "OK");
        shutdown.set();
    }

    #[tokio::test]
    async fn test_malformed_shutdown_gets_no_ok() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(ProcessSupervisor::new(vec![], dir.path().join("p.json")));
        let (addr, shutdown) = start_server(supervisor).await;

        let (mut reader, mut writer) = connect(addr).await;
        writer.write_line("STATE").await.unwrap();
        assert_eq!(reader.read_line_timeout(WAIT).await.unwrap(), "STARTED");

        writer.write_line("QUIT").await.unwrap();
        let err = reader.read_line_timeout(WAIT).await.unwrap_err();
        assert!(matches!(err, ChannelError::Eof));
        shutdown.set();
    }

    #[tokio::test]
    async fn test_unusable_state_file_reports_failed_update_task() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-directory");
        std::fs::write(&blocker, "").unwrap();
        let supervisor = Arc::new(ProcessSupervisor::new(
            vec![],
            blocker.join("process.json"),
        ));
        let (addr, shutdown) = start_server(supervisor).await;

        let (mut reader, mut writer) = connect(addr).await;
        writer.write_line("STATE").await.unwrap();
        assert_eq!(
            reader.read_line_timeout(WAIT).await.unwrap(),
            "ERROR cannot start update task"
        );

        writer.write_line("BYE").await.unwrap();
        assert_eq!(reader.read_line_timeout(WAIT).await.unwrap(), "OK");
        shutdown.set();
    }

    #[tokio::test]
    async fn test_update_task_stops_within_one_interval() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(ProcessSupervisor::new(vec![], dir.path().join("p.json")));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, _) = listener.accept().await.unwrap();
        let _client = client.await.unwrap();
        let (_reader, writer) = channel::split(stream);

        let interval = Duration::from_millis(500);
        let task = UpdateTask::spawn(supervisor, Arc::new(Mutex::new(writer)), interval);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());

        let stop_requested = Instant::now();
        task.shutdown().await;
        assert!(stop_requested.elapsed() < interval + Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_daemon_shutdown_ends_waiting_session() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(ProcessSupervisor::new(vec![], dir.path().join("p.json")));
        let (addr, shutdown) = start_server(supervisor).await;

        let (mut reader, mut writer) = connect(addr).await;
        writer.write_line("STATE").await.unwrap();
        assert_eq!(reader.read_line_timeout(WAIT).await.unwrap(), "STARTED");

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.set();
        let err = reader.read_line_timeout(WAIT).await.unwrap_err();
        assert!(matches!(err, ChannelError::Eof));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_serialize_stops_updates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("process.tmp")).unwrap();
        let supervisor = Arc::new(
            ProcessSupervisor::new(
                vec![sleeper("gw").autostart(true), sleeper("sat")],
                dir.path().join("process.json"),
            )
            .with_stop_timeout(Duration::from_secs(2)),
        );
        let config = StateServerConfig {
            startup_grace: Duration::from_millis(500),
            ..test_config()
        };
        let (addr, shutdown, _) = spawn_server(Arc::clone(&supervisor), config).await;

        let (mut reader, mut writer) = connect(addr).await;
        writer.write_line("STATE").await.unwrap();
        assert_eq!(reader.read_line_timeout(WAIT).await.unwrap(), "STARTED gw");

        supervisor.start("sat").await.unwrap();
        assert_eq!(
            reader.read_line_timeout(WAIT).await.unwrap(),
            "ERROR cannot start update task"
        );

        writer.write_line("BYE").await.unwrap();
        assert_eq!(reader.read_line_timeout(WAIT).await.unwrap(), "OK");
        shutdown.set();
    }

    #[tokio::test]
    async fn test_shutdown_before_state_runs_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(ProcessSupervisor::new(vec![], dir.path().join("p.json")));
        let (addr, shutdown, serve) = spawn_server(supervisor, test_config()).await;

        let (mut reader, _writer) = connect(addr).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stop_requested = Instant::now();
        shutdown.set();
        let err = reader.read_line_timeout(WAIT).await.unwrap_err();
        assert!(matches!(err, ChannelError::Eof));
        tokio::time::timeout(WAIT, serve).await.unwrap().unwrap();
        assert!(stop_requested.elapsed() < Duration::from_secs(2));
    }
}
