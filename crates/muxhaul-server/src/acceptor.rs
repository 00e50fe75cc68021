//! Tunnel acceptor
//!
//! Listens on the tunnel address for the lifetime of one generation. The
//! first connection becomes the control channel; later ones from the same
//! agent IP are pooled as raw tunnel connections.

use crate::control;
use crate::error::ServerError;
use crate::generation::Generation;
use crate::status::STATUS_DISCONNECTED;
use crate::supervisor::Supervisor;
use muxhaul_transport::{tune_socket, PushError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub async fn run_tunnel_acceptor(supervisor: Arc<Supervisor>, generation: Arc<Generation>) {
    let config = supervisor.config().clone();
    supervisor.status().set(STATUS_DISCONNECTED);

    let listener = match TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            supervisor.report_fatal(ServerError::BindError {
                address: config.bind_addr.clone(),
                reason: e.to_string(),
            });
            return;
        }
    };
    let local_addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| config.bind_addr.clone());
    info!("server started successfully, listening on address: {}", local_addr);

    let cancel = generation.cancel_token().clone();
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("failed to accept tunnel connection on {}: {}", local_addr, e);
                    continue;
                }
            },
        };
        admit(&supervisor, &generation, stream, peer_addr);
    }

    generation.pool().close();
    debug!("tunnel acceptor for generation {} stopped", generation.id());
}

fn admit(
    supervisor: &Arc<Supervisor>,
    generation: &Arc<Generation>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    if let Some(agent_ip) = generation.control().peer_ip() {
        if agent_ip != peer_addr.ip() {
            debug!(
                "suspicious packet from {}. expected address: {}. discarding packet...",
                peer_addr, agent_ip
            );
            return;
        }
    }

    tune_socket(&stream, &supervisor.config().socket);

    if !generation.control().is_installed() {
        info!("control channel not found, attempting to establish a new session");
        tokio::spawn(control::establish_control_channel(
            supervisor.clone(),
            generation.clone(),
            stream,
            peer_addr,
        ));
        return;
    }

    let pool = generation.pool();
    match pool.try_push(stream) {
        Ok(()) => debug!(
            "tunnel connection from {} pooled ({}/{})",
            peer_addr,
            pool.len(),
            pool.capacity()
        ),
        Err(PushError::Full(_)) => {
            warn!("tunnel channel is full, discarding connection from {}", peer_addr);
        }
        Err(PushError::Closed(_)) => {
            debug!("tunnel pool closed, discarding connection from {}", peer_addr);
        }
    }
}
