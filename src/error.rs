use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures of a line-oriented control channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("no data received within {0:?}")]
    Timeout(Duration),

    #[error("distant socket is closed")]
    Eof,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("unknown process '{0}'")]
    UnknownProcess(String),

    #[error("cannot start process '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot signal process '{name}': {source}")]
    Signal {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot persist process state to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("process state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe datagram too short ({len} bytes)")]
    Short { len: usize },

    #[error("unknown component id {0}")]
    UnknownComponent(u8),
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("unexpected instruction '{0}'")]
    Protocol(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ControlError>;
