//! Host daemon.
//!
//! One daemon runs on every host of the platform and supervises the
//! processes emulating that host's role.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │                sand daemon                │
//! ├──────────────────────────────────────────┤
//! │  StateServer      │  CommandServer        │
//! │  (STATE/BYE push) │  (START/STOP)         │
//! ├──────────────────────────────────────────┤
//! │            ProcessSupervisor              │
//! │   gw │ sat │ st0 │ st1 │ ...  + state file │
//! └──────────────────────────────────────────┘
//! ```

pub mod controller;
pub mod server;
pub mod state_server;
pub mod supervisor;

pub use controller::SupervisorController;
pub use server::DaemonServer;
pub use state_server::{StateServer, StateServerConfig};
pub use supervisor::{PersistedState, ProcessState, ProcessSupervisor};
