//! Control channel: handshake, signal writer and liveness monitor
//!
//! The first connection of a generation authenticates with the shared token
//! and becomes the control channel. The server sends heartbeats and
//! batch-ready signals over it; the agent may announce shutdown with
//! `"closed"`. Any failure on this channel restarts the whole generation.

use crate::generation::Generation;
use crate::listener;
use crate::status::STATUS_CONNECTED;
use crate::supervisor::Supervisor;
use futures::{SinkExt, StreamExt};
use muxhaul_proto::{receive_signal, send_signal, CodecError, Signal, SignalCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// How long the agent has to present its token
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

const WRITER_QUEUE_SIZE: usize = 64;

/// Read side of an installed control channel
pub type ControlReader = FramedRead<OwnedReadHalf, SignalCodec>;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("timeout while waiting for control channel signal")]
    Timeout,

    #[error("failed to read control channel signal: {0}")]
    Receive(CodecError),

    #[error("invalid security token received")]
    InvalidToken,

    #[error("failed to send security token: {0}")]
    Send(CodecError),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control channel writer is gone")]
    WriterClosed,

    #[error("failed to write control signal: {0}")]
    Write(String),
}

/// Authenticate a candidate control connection.
///
/// Reads one frame within `HANDSHAKE_TIMEOUT`; it must equal `token`, which is
/// then echoed back.
pub async fn handshake(stream: &mut TcpStream, token: &str) -> Result<(), HandshakeError> {
    let presented = match timeout(HANDSHAKE_TIMEOUT, receive_signal(stream)).await {
        Err(_) => return Err(HandshakeError::Timeout),
        Ok(Err(e)) => return Err(HandshakeError::Receive(e)),
        Ok(Ok(presented)) => presented,
    };

    if presented != token {
        return Err(HandshakeError::InvalidToken);
    }

    send_signal(stream, token)
        .await
        .map_err(HandshakeError::Send)
}

struct WriteRequest {
    signal: Signal,
    reply: oneshot::Sender<Result<(), ControlError>>,
}

/// Serialized writer for the control connection
pub struct ControlChannel {
    peer_addr: SocketAddr,
    requests: mpsc::Sender<WriteRequest>,
}

impl ControlChannel {
    /// Split the authenticated connection and start its writer task.
    ///
    /// The writer stops when `cancel` fires, when a write fails, or when the
    /// last handle to the channel is dropped.
    pub fn spawn(
        stream: TcpStream,
        cancel: CancellationToken,
    ) -> std::io::Result<(Arc<Self>, ControlReader)> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (requests, rx) = mpsc::channel(WRITER_QUEUE_SIZE);

        tokio::spawn(run_writer(
            FramedWrite::new(write_half, SignalCodec::new()),
            rx,
            cancel,
            peer_addr,
        ));

        let channel = Arc::new(Self {
            peer_addr,
            requests,
        });
        Ok((channel, FramedRead::new(read_half, SignalCodec::new())))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue a signal and wait until it has been written and flushed
    pub async fn send(&self, signal: Signal) -> Result<(), ControlError> {
        let (reply, done) = oneshot::channel();
        self.requests
            .send(WriteRequest { signal, reply })
            .await
            .map_err(|_| ControlError::WriterClosed)?;
        done.await.map_err(|_| ControlError::WriterClosed)?
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

async fn run_writer(
    mut sink: FramedWrite<OwnedWriteHalf, SignalCodec>,
    mut requests: mpsc::Receiver<WriteRequest>,
    cancel: CancellationToken,
    peer_addr: SocketAddr,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let result = sink
            .send(request.signal)
            .await
            .map_err(|e| ControlError::Write(e.to_string()));
        let failed = result.is_err();
        let _ = request.reply.send(result);
        if failed {
            break;
        }
    }
    debug!("control channel writer for {} stopped", peer_addr);
}

/// Handle the first connection of a generation: authenticate it, install it as
/// the control channel and bring up the rest of the pipeline.
pub async fn establish_control_channel(
    supervisor: Arc<Supervisor>,
    generation: Arc<Generation>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
) {
    match handshake(&mut stream, &supervisor.config().token).await {
        Ok(()) => {}
        Err(HandshakeError::Timeout) => {
            warn!("timeout while waiting for control channel signal from {}", peer_addr);
            return;
        }
        Err(HandshakeError::InvalidToken) => {
            warn!("invalid security token received from {}", peer_addr);
            return;
        }
        Err(e) => {
            error!("control channel handshake with {} failed: {}", peer_addr, e);
            return;
        }
    }

    if generation.is_cancelled() {
        return;
    }

    let (channel, reader) =
        match ControlChannel::spawn(stream, generation.cancel_token().child_token()) {
            Ok(pair) => pair,
            Err(e) => {
                error!("failed to set up control channel for {}: {}", peer_addr, e);
                return;
            }
        };

    if generation.control().install(channel.clone()).is_err() {
        warn!(
            "control channel already established, closing duplicate from {}",
            peer_addr
        );
        return;
    }

    supervisor.status().set(STATUS_CONNECTED);
    info!("control channel successfully established with {}", peer_addr);

    tokio::spawn(monitor_control_channel(
        supervisor.clone(),
        generation.clone(),
        reader,
        supervisor.config().heartbeat,
    ));

    listener::start_local_listeners(&supervisor, &generation);
}

/// Send heartbeats and watch the read side until something fails.
///
/// Exactly one restart is requested for whatever failure ends the loop; a
/// cancelled generation exits silently.
pub async fn monitor_control_channel(
    supervisor: Arc<Supervisor>,
    generation: Arc<Generation>,
    mut reader: ControlReader,
    interval: Duration,
) {
    let cancel = generation.cancel_token().clone();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            _ = ticker.tick() => {
                let Some(channel) = generation.control().get() else {
                    warn!("control channel is missing, restarting");
                    supervisor.trigger_restart(&generation);
                    return;
                };

                // A stalled peer must not park the heartbeat forever
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = timeout(interval, channel.send(Signal::Heartbeat)) => sent,
                };
                match sent {
                    Ok(Ok(())) => trace!("heartbeat signal sent successfully"),
                    Ok(Err(e)) => {
                        error!("failed to send heartbeat signal: {}", e);
                        supervisor.trigger_restart(&generation);
                        return;
                    }
                    Err(_) => {
                        error!("heartbeat signal stalled for {:?}", interval);
                        supervisor.trigger_restart(&generation);
                        return;
                    }
                }
            }

            frame = reader.next() => match frame {
                Some(Ok(payload)) => {
                    if Signal::parse(&payload) == Some(Signal::Closed) {
                        info!("control channel has been closed by the client");
                        supervisor.trigger_restart(&generation);
                        return;
                    }
                    debug!("ignoring control signal {:?}", payload);
                }
                Some(Err(e)) => {
                    if e.is_disconnect() {
                        info!("control channel disconnected: {}", e);
                    } else {
                        error!("failed to read from control channel: {}", e);
                    }
                    supervisor.trigger_restart(&generation);
                    return;
                }
                None => {
                    info!("control channel closed by peer");
                    supervisor.trigger_restart(&generation);
                    return;
                }
            },
        }
    }
}
