//! Muxhaul tunnel server
//!
//! Server side of a reverse TCP tunnel. A remote agent authenticates a single
//! control channel, then supplies raw tunnel connections which are pooled and
//! turned into smux sessions. Client connections accepted on the configured
//! port mappings are batched into logical streams on those sessions. Any
//! liveness failure tears the whole pipeline down and rebuilds it.

pub mod acceptor;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod generation;
pub mod listener;
pub mod mapping;
pub mod server;
pub mod status;
pub mod supervisor;
pub mod usage;

pub use config::{ServerConfig, TunnelConfig};
pub use control::{ControlChannel, ControlError, HandshakeError, HANDSHAKE_TIMEOUT};
pub use dispatcher::{BatchOutcome, SessionDispatcher};
pub use error::{ConfigError, ServerError};
pub use generation::{ControlSlot, Generation};
pub use listener::PendingClient;
pub use mapping::PortMapping;
pub use server::TcpMuxServer;
pub use status::{TunnelStatus, STATUS_CONNECTED, STATUS_DISCONNECTED};
pub use supervisor::Supervisor;
pub use usage::{PortUsage, UsageMonitor, UsageSnapshot};
