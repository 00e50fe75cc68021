//! Session dispatcher
//!
//! Each mapping worker takes one pooled tunnel connection at a time, wraps it
//! in a mux session and feeds it exactly `mux_con` client connections. When a
//! session's batch is full the agent is told to open another tunnel
//! connection, and the session is closed once every stream of the batch has
//! finished relaying. A failed stream open rolls the session back: the client
//! goes back to the head of its queue and the next pooled connection is used.

use crate::generation::Generation;
use crate::listener::PendingClient;
use crate::supervisor::Supervisor;
use crate::usage::UsageMonitor;
use muxhaul_proto::{send_signal, Signal};
use muxhaul_transport::{relay, BoundedQueue, Direction, MuxSession, SmuxSession};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// How a session's dispatch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The batch was filled and the agent was signalled
    Filled,
    /// A stream failed to open; the session was closed and the client requeued
    RolledBack,
    /// The mapping queue was closed
    QueueClosed,
    /// The generation was cancelled
    Cancelled,
    /// The batch-ready signal could not be delivered
    SignalFailed,
}

/// Drain one mapping queue into mux sessions until the generation ends
pub async fn run_mapping_worker(
    supervisor: Arc<Supervisor>,
    generation: Arc<Generation>,
    queue: Arc<BoundedQueue<PendingClient>>,
    remote_addr: String,
) {
    let config = supervisor.config().clone();
    let cancel = generation.cancel_token().clone();
    let usage = config.sniffer.then(|| supervisor.usage().clone());

    loop {
        let tunnel_conn = tokio::select! {
            _ = cancel.cancelled() => break,
            conn = generation.pool().pop() => match conn {
                Some(conn) => conn,
                None => break,
            },
        };

        let peer_addr = tunnel_conn.peer_addr().ok();
        let session = match SmuxSession::client(tunnel_conn, &config.smux) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                error!("failed to create mux session for {:?}: {}", peer_addr, e);
                supervisor.trigger_restart(&generation);
                break;
            }
        };

        let dispatcher = SessionDispatcher::new(
            session,
            config.mux_con,
            remote_addr.clone(),
            generation.clone(),
            usage.clone(),
        );
        match dispatcher.dispatch(&queue).await {
            BatchOutcome::Filled | BatchOutcome::RolledBack => continue,
            BatchOutcome::QueueClosed | BatchOutcome::Cancelled => break,
            BatchOutcome::SignalFailed => {
                supervisor.trigger_restart(&generation);
                break;
            }
        }
    }

    debug!("mapping worker for {} stopped", remote_addr);
}

/// Fills one mux session with a batch of client connections
pub struct SessionDispatcher<S: MuxSession> {
    session: Arc<S>,
    batch_size: usize,
    remote_addr: String,
    generation: Arc<Generation>,
    usage: Option<Arc<UsageMonitor>>,
}

impl<S: MuxSession + 'static> SessionDispatcher<S> {
    pub fn new(
        session: Arc<S>,
        batch_size: usize,
        remote_addr: String,
        generation: Arc<Generation>,
        usage: Option<Arc<UsageMonitor>>,
    ) -> Self {
        Self {
            session,
            batch_size: batch_size.max(1),
            remote_addr,
            generation,
            usage,
        }
    }

    /// Open one stream per queued client until the batch is full or the
    /// session fails.
    pub async fn dispatch(self, queue: &BoundedQueue<PendingClient>) -> BatchOutcome {
        let cancel = self.generation.cancel_token().clone();
        let (done_tx, done_rx) = mpsc::channel::<()>(self.batch_size);
        let mut opened = 0;

        loop {
            let client = tokio::select! {
                _ = cancel.cancelled() => return BatchOutcome::Cancelled,
                client = queue.pop() => match client {
                    Some(client) => client,
                    None => return BatchOutcome::QueueClosed,
                },
            };

            let mut stream = match self.session.open_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("failed to open a new mux stream: {}", e);
                    self.rollback(queue, client).await;
                    return BatchOutcome::RolledBack;
                }
            };

            if let Err(e) = send_signal(&mut stream, &self.remote_addr).await {
                error!(
                    "failed to send target address {} over mux stream: {}",
                    self.remote_addr, e
                );
                self.rollback(queue, client).await;
                return BatchOutcome::RolledBack;
            }

            self.spawn_relay(stream, client, done_tx.clone());
            opened += 1;

            if opened == self.batch_size {
                break;
            }
        }

        let Some(control) = self.generation.control().get() else {
            error!("control channel is gone, cannot signal batch completion");
            return BatchOutcome::SignalFailed;
        };
        let signalled = tokio::select! {
            _ = cancel.cancelled() => return BatchOutcome::Cancelled,
            signalled = control.send(Signal::BatchReady) => signalled,
        };
        if let Err(e) = signalled {
            error!("error sending batch-ready signal: {}", e);
            return BatchOutcome::SignalFailed;
        }

        drop(done_tx);
        tokio::spawn(close_when_done(
            self.session,
            self.batch_size,
            done_rx,
            self.generation,
        ));
        BatchOutcome::Filled
    }

    async fn rollback(&self, queue: &BoundedQueue<PendingClient>, client: PendingClient) {
        self.session.close().await;
        if let Err(e) = queue.push_front(client) {
            warn!("could not requeue client connection: {}", e);
        }
    }

    fn spawn_relay(&self, stream: S::Stream, client: PendingClient, done: mpsc::Sender<()>) {
        let cancel = self.generation.cancel_token().clone();
        let usage = self.usage.clone();
        let port = client.local_port;
        let peer_addr = client.peer_addr;

        tokio::spawn(async move {
            let on_transfer = move |_: Direction, n: usize| {
                if let Some(usage) = &usage {
                    usage.record_bytes(port, n as u64);
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                stats = relay(stream, client.stream, on_transfer) => {
                    debug!(
                        "connection from {} finished ({} bytes in, {} bytes out)",
                        peer_addr, stats.backward, stats.forward
                    );
                }
            }
            let _ = done.send(()).await;
        });
    }
}

async fn close_when_done<S: MuxSession>(
    session: Arc<S>,
    batch_size: usize,
    mut done: mpsc::Receiver<()>,
    generation: Arc<Generation>,
) {
    let cancel = generation.cancel_token().clone();
    for _ in 0..batch_size {
        tokio::select! {
            _ = cancel.cancelled() => break,
            finished = done.recv() => if finished.is_none() {
                break;
            },
        }
    }
    session.close().await;
    debug!("mux session closed after serving its batch of {}", batch_size);
}
