//! Platform manager core.
//!
//! ```text
//!  operator ──START/STOP──▶ CommandServer ──▶ PlatformController ──▶ daemons
//!  daemons  ──STARTED────▶ HostWatcher  ─┐
//!  entities ──UDP probes─▶ ProbeListener ─┴─▶ ManagerEvent channel
//! ```

pub mod collector;
pub mod controller;
pub mod events;
pub mod host;
pub mod probe;
pub mod series;
pub mod server;

pub use collector::ProbeListener;
pub use controller::PlatformController;
pub use events::ManagerEvent;
pub use host::{send_command, HostWatcher};
pub use probe::{ComponentId, ProbeRecord, Sample};
pub use series::{IndexedSeries, ProbeStore};
pub use server::ManagerServer;
