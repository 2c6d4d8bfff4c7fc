//! Request/response command server shared by daemons and the manager.
//!
//! Each request line gets exactly one reply line. `START [run]` and `STOP`
//! are handed to a [`Controller`]; everything else is answered with `ERROR`.

use crate::channel::{self, CONTROL_READ_TIMEOUT};
use crate::error::ChannelError;
use crate::protocol::{Command, Reply};
use crate::stop::StopFlag;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Something that can start and stop a platform.
///
/// `Ok(false)` is a refusal and `Err` a failure; both are reported to the
/// client as `ERROR`.
pub trait Controller: Send + Sync + 'static {
    fn start(&self, run: &str) -> impl Future<Output = anyhow::Result<bool>> + Send;
    fn stop(&self) -> impl Future<Output = anyhow::Result<bool>> + Send;
}

pub struct CommandServer<C> {
    controller: Arc<C>,
    read_timeout: Duration,
}

impl<C: Controller> CommandServer<C> {
    pub fn new(controller: Arc<C>) -> Self {
        Self {
            controller,
            read_timeout: CONTROL_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Accept clients until `shutdown` is set, then wait for open sessions.
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
                        Err(e) => error!("Command server accept error: {}", e),
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Command session failed: {}", e);
                    }
                }
                _ = shutdown.wait() => break,
            }
        }

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("Command session failed: {}", e);
            }
        }
        debug!("Command server stopped");
    }

    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, shutdown: StopFlag) {
        debug!("Command connection from {}", peer);
        let (mut reader, mut writer) = channel::split(stream);

        loop {
            let read = tokio::select! {
                read = reader.read_line_timeout(self.read_timeout) => read,
                _ = shutdown.wait() => break,
            };
            let line = match read {
                Ok(line) => line,
                Err(ChannelError::Eof) => {
                    debug!("Command connection from {} closed", peer);
                    break;
                }
                Err(ChannelError::Timeout(t)) => {
                    debug!("No command from {} within {:?}, closing", peer, t);
                    break;
                }
                Err(e) => {
                    error!("Command connection from {} failed: {}", peer, e);
                    break;
                }
            };

            let reply = self.dispatch(Command::parse(&line)).await;
            if let Err(e) = writer.write_line(&reply.to_string()).await {
                error!("Cannot reply to {}: {}", peer, e);
                break;
            }
        }

        if let Err(e) = writer.finish().await {
            debug!("Closing command connection: {}", e);
        }
    }

    pub async fn dispatch(&self, command: Command) -> Reply {
        let outcome = match &command {
            Command::Start(run) => {
                info!("Starting platform (run '{}')", run);
                self.controller.start(run).await
            }
            Command::Stop => {
                info!("Stopping platform");
                self.controller.stop().await
            }
            other => {
                warn!("Unknown command '{}'", other);
                return Reply::Error(None);
            }
        };

        match outcome {
            Ok(true) => Reply::Ok,
            Ok(false) => {
                warn!("'{}' refused", command);
                Reply::Error(None)
            }
            Err(e) => {
                error!("'{}' failed: {:#}", command, e);
                Reply::Error(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        refuse_stop: bool,
    }

    impl Controller for Recorder {
        async fn start(&self, run: &str) -> anyhow::Result<bool> {
            self.calls.lock().unwrap().push(format!("start {run}"));
            if run == "broken" {
                anyhow::bail!("cannot start");
            }
            Ok(true)
        }

        async fn stop(&self) -> anyhow::Result<bool> {
            self.calls.lock().unwrap().push("stop".into());
            Ok(!self.refuse_stop)
        }
    }

    #[tokio::test]
    async fn test_dispatch_maps_outcomes_to_replies() {
        let server = CommandServer::new(Arc::new(Recorder::default()));
        assert_eq!(server.dispatch(Command::Start("r1".into())).await, Reply::Ok);
        assert_eq!(
            server.dispatch(Command::Start("broken".into())).await,
            Reply::Error(None)
        );
        assert_eq!(server.dispatch(Command::Stop).await, Reply::Ok);
        assert_eq!(server.dispatch(Command::State).await, Reply::Error(None));
        assert_eq!(
            server.dispatch(Command::Unknown("HELLO".into())).await,
            Reply::Error(None)
        );

        let calls = server.controller.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["start r1", "start broken", "stop"]);
    }

    #[tokio::test]
    async fn test_refusal_is_an_error_reply() {
        let controller = Recorder {
            refuse_stop: true,
            ..Default::default()
        };
        let server = CommandServer::new(Arc::new(controller));
        assert_eq!(server.dispatch(Command::Stop).await, Reply::Error(None));
    }

    #[tokio::test]
    async fn test_session_answers_each_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = StopFlag::new();
        let controller = Arc::new(Recorder::default());
        let server = Arc::new(CommandServer::new(Arc::clone(&controller)));
        tokio::spawn(server.serve(listener, shutdown.clone()));

        let (mut reader, mut writer) = channel::split(TcpStream::connect(addr).await.unwrap());
        let wait = Duration::from_secs(5);

        writer.write_line("START").await.unwrap();
        assert_eq!(reader.read_line_timeout(wait).await.unwrap(), "OK");
        writer.write_line("PING").await.unwrap();
        assert_eq!(reader.read_line_timeout(wait).await.unwrap(), "ERROR");
        writer.write_line("STOP").await.unwrap();
        assert_eq!(reader.read_line_timeout(wait).await.unwrap(), "OK");

        assert_eq!(
            controller.calls.lock().unwrap().clone(),
            vec!["start default", "stop"]
        );
        shutdown.set();
    }

    #[tokio::test]
    async fn test_idle_session_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = StopFlag::new();
        let server = Arc::new(
            CommandServer::new(Arc::new(Recorder::default()))
                .with_read_timeout(Duration::from_millis(100)),
        );
        tokio::spawn(server.serve(listener, shutdown.clone()));

        let (mut reader, _writer) = channel::split(TcpStream::connect(addr).await.unwrap());
        let err = reader
            .read_line_timeout(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Eof));

        // The listener survives the dropped session.
        let (mut reader, mut writer) = channel::split(TcpStream::connect(addr).await.unwrap());
        writer.write_line("STOP").await.unwrap();
        assert_eq!(
            reader.read_line_timeout(Duration::from_secs(5)).await.unwrap(),
            "OK"
        );
        shutdown.set();
    }

    #[tokio::test]
    async fn test_serve_returns_after_open_sessions_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = StopFlag::new();
        let server = Arc::new(CommandServer::new(Arc::new(Recorder::default())));
        let serve = tokio::spawn(server.serve(listener, shutdown.clone()));

        let (mut reader, _writer) = channel::split(TcpStream::connect(addr).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.set();

        let wait = Duration::from_secs(5);
        let err = reader.read_line_timeout(wait).await.unwrap_err();
        assert!(matches!(err, ChannelError::Eof));
        tokio::time::timeout(wait, serve).await.unwrap().unwrap();
    }
}
