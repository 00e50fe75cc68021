//! Transport layer for muxhaul
//!
//! This crate provides the pieces the tunnel server builds on:
//! - A multiplexed session abstraction (`MuxSession`) with an smux v1 implementation
//! - A bounded drop-on-full queue used for the tunnel pool and per-mapping queues
//! - Socket tuning for accepted TCP connections
//! - The bidirectional relay between a client connection and a logical stream

pub mod queue;
pub mod relay;
pub mod smux;
pub mod socket;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use queue::{BoundedQueue, PushError};
pub use relay::{relay, Direction, RelayStats};
pub use smux::{SmuxConfig, SmuxSession};
pub use socket::{tune_socket, SocketOptions};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Session closed")]
    SessionClosed,

    #[error("Failed to open stream: {0}")]
    OpenStream(String),

    #[error("Invalid mux configuration: {0}")]
    InvalidConfig(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A multiplexed session over a single tunnel connection.
///
/// Each call to `open_stream` yields an independent logical stream. Closing
/// the session tears down every stream opened on it.
#[async_trait]
pub trait MuxSession: Send + Sync {
    /// Logical stream type
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new logical stream
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Close the session and the underlying connection
    async fn close(&self);

    /// Whether the session has been closed
    fn is_closed(&self) -> bool;
}
