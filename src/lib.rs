pub mod channel;
pub mod clienv;
pub mod command_server;
pub mod config;
pub mod daemon;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod stop;

pub use error::{ControlError, Result};
pub use stop::StopFlag;
