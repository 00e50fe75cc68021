//! Top-level server handle

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::status::TunnelStatus;
use crate::supervisor::Supervisor;
use crate::usage::UsageMonitor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Reverse tunnel server speaking smux over pooled TCP connections
pub struct TcpMuxServer {
    supervisor: Arc<Supervisor>,
    fatal_rx: mpsc::UnboundedReceiver<ServerError>,
    shutdown: CancellationToken,
}

impl TcpMuxServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_shutdown(config, CancellationToken::new())
    }

    /// Build a server that stops when `shutdown` is cancelled
    pub fn with_shutdown(config: ServerConfig, shutdown: CancellationToken) -> Self {
        let status = TunnelStatus::new();
        let usage = Arc::new(UsageMonitor::new(status.clone()));
        let (supervisor, fatal_rx) = Supervisor::new(config, status, usage, shutdown.clone());
        Self {
            supervisor,
            fatal_rx,
            shutdown,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn status(&self) -> TunnelStatus {
        self.supervisor.status().clone()
    }

    pub fn usage(&self) -> Arc<UsageMonitor> {
        self.supervisor.usage().clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown is requested or a fatal error occurs.
    ///
    /// Restarts after control-channel failures happen inside; only a failure
    /// to bind the tunnel address ends `run` with an error.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let config = self.supervisor.config().clone();
        let usage = self.supervisor.usage().clone();

        if config.web_port > 0 {
            let addr = SocketAddr::from(([0, 0, 0, 0], config.web_port));
            let cancel = self.shutdown.clone();
            let usage = usage.clone();
            tokio::spawn(async move {
                if let Err(e) = usage.bind_and_serve(addr, cancel).await {
                    error!("usage dashboard on {} failed: {}", addr, e);
                }
            });
        }

        if config.sniffer {
            tokio::spawn(
                usage
                    .clone()
                    .run_sniffer_log(config.sniffer_log.clone(), self.shutdown.clone()),
            );
        }

        info!(
            "starting tunnel server on {} with {} port mapping(s)",
            config.bind_addr,
            config.mappings.len()
        );
        self.supervisor.start();

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("tunnel server shutting down");
                Ok(())
            }
            fatal = self.fatal_rx.recv() => {
                self.shutdown.cancel();
                match fatal {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        }
    }
}
