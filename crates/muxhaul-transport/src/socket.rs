//! Socket options for accepted TCP connections

use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{trace, warn};

/// Options applied to every accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// TCP_NODELAY
    pub nodelay: bool,
    /// Idle time before keep-alive probes are sent
    pub keepalive: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: false,
            keepalive: Duration::from_secs(75),
        }
    }
}

/// Apply socket options. Best effort: failures are logged, never returned.
pub fn tune_socket(stream: &TcpStream, options: &SocketOptions) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    match stream.set_nodelay(options.nodelay) {
        Ok(()) => trace!("TCP_NODELAY={} for {}", options.nodelay, peer),
        Err(e) => warn!("failed to set TCP_NODELAY for {}: {}", peer, e),
    }

    let keepalive = TcpKeepalive::new().with_time(options.keepalive);
    match SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        Ok(()) => trace!(
            "TCP keep-alive enabled for {} (period {:?})",
            peer,
            options.keepalive
        ),
        Err(e) => warn!("failed to set TCP keep-alive for {}: {}", peer, e),
    }
}
