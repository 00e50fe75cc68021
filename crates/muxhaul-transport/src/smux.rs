//! smux v1 sessions over raw tunnel connections
//!
//! The server acts as the smux client: it opens streams, the remote agent
//! accepts them.

use crate::{MuxSession, TransportError, TransportResult};
use async_smux::{MuxAcceptor, MuxBuilder, MuxConnector, MuxStream};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::num::NonZeroU64;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Only smux protocol version 1 is spoken
pub const SUPPORTED_SMUX_VERSION: u8 = 1;

/// NOP frame period on every session. Agents drop a session after 30s of
/// silence, so an idle pooled session has to keep talking.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Multiplexing protocol tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmuxConfig {
    pub version: u8,
    /// Unit for the queue depths below. Outgoing data frames are always cut
    /// at the smux v1 maximum of 65535 bytes; this does not cap them.
    pub max_frame_size: usize,
    pub max_receive_buffer: usize,
    pub max_stream_buffer: usize,
    /// Whole seconds, at least one
    pub keep_alive_interval: Duration,
}

impl Default for SmuxConfig {
    fn default() -> Self {
        Self {
            version: SUPPORTED_SMUX_VERSION,
            max_frame_size: 32 * 1024,
            max_receive_buffer: 4 * 1024 * 1024,
            max_stream_buffer: 64 * 1024,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
        }
    }
}

impl SmuxConfig {
    pub fn validate(&self) -> TransportResult<()> {
        if self.version != SUPPORTED_SMUX_VERSION {
            return Err(TransportError::InvalidConfig(format!(
                "unsupported smux version {} (only {} is supported)",
                self.version, SUPPORTED_SMUX_VERSION
            )));
        }
        if self.max_frame_size == 0 {
            return Err(TransportError::InvalidConfig(
                "max frame size must be greater than zero".to_string(),
            ));
        }
        if self.max_receive_buffer == 0 || self.max_stream_buffer == 0 {
            return Err(TransportError::InvalidConfig(
                "receive and stream buffers must be greater than zero".to_string(),
            ));
        }
        if self.keep_alive_interval.as_secs() == 0 {
            return Err(TransportError::InvalidConfig(
                "keep-alive interval must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    /// Receive queue depth in frames
    pub fn rx_queue(&self) -> usize {
        (self.max_receive_buffer / self.max_frame_size.max(1)).max(1)
    }

    /// Transmit queue depth in frames
    pub fn tx_queue(&self) -> usize {
        (self.max_stream_buffer / self.max_frame_size.max(1)).max(1)
    }
}

/// A client-side smux session bound to one tunnel connection
pub struct SmuxSession {
    connector: Mutex<MuxConnector<TcpStream>>,
    // Held so the worker keeps a live accept side; the agent never opens streams.
    _acceptor: Mutex<MuxAcceptor<TcpStream>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    peer_addr: Option<SocketAddr>,
    closed: AtomicBool,
}

impl SmuxSession {
    /// Wrap a tunnel connection in a new smux client session.
    ///
    /// Spawns the mux worker that drives the connection; it runs until the
    /// session is closed or the connection fails.
    pub fn client(conn: TcpStream, config: &SmuxConfig) -> TransportResult<Self> {
        config.validate()?;

        let rx_queue = NonZeroUsize::new(config.rx_queue())
            .ok_or_else(|| TransportError::InvalidConfig("empty receive queue".to_string()))?;
        let tx_queue = NonZeroUsize::new(config.tx_queue())
            .ok_or_else(|| TransportError::InvalidConfig("empty transmit queue".to_string()))?;
        let keep_alive = NonZeroU64::new(config.keep_alive_interval.as_secs()).ok_or_else(|| {
            TransportError::InvalidConfig("keep-alive interval below one second".to_string())
        })?;

        let peer_addr = conn.peer_addr().ok();

        let mut builder = MuxBuilder::client();
        builder.with_max_rx_queue(rx_queue);
        builder.with_max_tx_queue(tx_queue);
        builder.with_keep_alive_interval(keep_alive);
        let (connector, acceptor, worker) = builder.with_connection(conn).build();

        let worker = tokio::spawn(async move {
            log_worker_result(worker.await);
        });

        debug!(
            "smux session created for {:?} (rx_queue={}, tx_queue={})",
            peer_addr, rx_queue, tx_queue
        );

        Ok(Self {
            connector: Mutex::new(connector),
            _acceptor: Mutex::new(acceptor),
            worker: Mutex::new(Some(worker)),
            peer_addr,
            closed: AtomicBool::new(false),
        })
    }

    fn shutdown_worker(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl MuxSession for SmuxSession {
    type Stream = MuxStream<TcpStream>;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let connector = self
            .connector
            .lock()
            .map_err(|_| TransportError::SessionClosed)?;
        connector
            .connect()
            .map_err(|e| TransportError::OpenStream(e.to_string()))
    }

    async fn close(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            debug!("closing smux session for {:?}", self.peer_addr);
        }
        self.shutdown_worker();
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        match self.worker.lock() {
            Ok(guard) => guard.as_ref().map_or(true, |h| h.is_finished()),
            Err(_) => true,
        }
    }
}

impl Drop for SmuxSession {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

fn log_worker_result(result: Result<(), async_smux::error::MuxError>) {
    if let Err(e) = result {
        match &e {
            async_smux::error::MuxError::ConnectionClosed
            | async_smux::error::MuxError::StreamClosed(_) => {
                debug!("smux worker closed: {:?}", e);
            }
            async_smux::error::MuxError::IoError(io) => {
                let expected = matches!(
                    io.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::NotConnected
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::UnexpectedEof
                );
                if expected {
                    debug!("smux worker closed: {:?}", e);
                } else {
                    error!("smux worker error: {:?}", e);
                }
            }
            _ => {
                error!("smux worker error: {:?}", e);
            }
        }
    }
}
