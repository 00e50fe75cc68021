//! Local listeners, one per port mapping
//!
//! Accepted client connections are queued per mapping; a dedicated worker
//! drains the queue into mux sessions.

use crate::dispatcher;
use crate::generation::Generation;
use crate::mapping::PortMapping;
use crate::supervisor::Supervisor;
use muxhaul_transport::{tune_socket, BoundedQueue, PushError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// A client connection waiting for a mux stream
#[derive(Debug)]
pub struct PendingClient {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    /// Local port the client connected to, used for usage accounting
    pub local_port: u16,
}

/// Start a listener and a worker for every configured mapping
pub fn start_local_listeners(supervisor: &Arc<Supervisor>, generation: &Arc<Generation>) {
    for mapping in &supervisor.config().mappings {
        tokio::spawn(run_local_listener(
            supervisor.clone(),
            generation.clone(),
            mapping.clone(),
        ));
    }
}

async fn run_local_listener(
    supervisor: Arc<Supervisor>,
    generation: Arc<Generation>,
    mapping: PortMapping,
) {
    let bind_addr = mapping.bind_addr();
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to start listener on {}: {}", bind_addr, e);
            return;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("failed to read local address of {}: {}", bind_addr, e);
            return;
        }
    };
    info!(
        "listener started successfully, listening on address: {} (target {})",
        local_addr, mapping.remote_addr
    );

    let queue = Arc::new(BoundedQueue::new(supervisor.config().channel_size));
    tokio::spawn(dispatcher::run_mapping_worker(
        supervisor.clone(),
        generation.clone(),
        queue.clone(),
        mapping.remote_addr.clone(),
    ));

    let cancel = generation.cancel_token().clone();
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("failed to accept connection on {}: {}", local_addr, e);
                    continue;
                }
            },
        };

        tune_socket(&stream, &supervisor.config().socket);

        let client = PendingClient {
            stream,
            peer_addr,
            local_port: local_addr.port(),
        };
        match queue.try_push(client) {
            Ok(()) => debug!(
                "accepted connection from {} on {} ({} queued)",
                peer_addr,
                local_addr,
                queue.len()
            ),
            Err(PushError::Full(_)) => warn!(
                "channel with listener {} is full, discarding TCP connection from {}",
                local_addr, peer_addr
            ),
            Err(PushError::Closed(_)) => break,
        }
    }

    queue.close();
    debug!("listener on {} stopped", local_addr);
}
