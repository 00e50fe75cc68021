//! Usage telemetry
//!
//! Per-local-port byte counters fed by the relay, a small JSON dashboard and
//! a periodic snapshot file.

use crate::status::TunnelStatus;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// How often the sniffer log is rewritten
pub const SNIFFER_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Bytes relayed through one local port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortUsage {
    pub port: u16,
    pub bytes: u64,
    pub updated_at: DateTime<Utc>,
}

/// Dashboard and sniffer log payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub total_bytes: u64,
    pub ports: Vec<PortUsage>,
}

#[derive(Debug)]
pub struct UsageMonitor {
    ports: DashMap<u16, PortUsage>,
    status: TunnelStatus,
    started_at: DateTime<Utc>,
}

impl UsageMonitor {
    pub fn new(status: TunnelStatus) -> Self {
        Self {
            ports: DashMap::new(),
            status,
            started_at: Utc::now(),
        }
    }

    pub fn record_bytes(&self, port: u16, bytes: u64) {
        let now = Utc::now();
        let mut entry = self.ports.entry(port).or_insert_with(|| PortUsage {
            port,
            bytes: 0,
            updated_at: now,
        });
        entry.bytes += bytes;
        entry.updated_at = now;
    }

    pub fn port_bytes(&self, port: u16) -> u64 {
        self.ports.get(&port).map(|u| u.bytes).unwrap_or(0)
    }

    /// Per-port usage, ordered by port
    pub fn port_usage(&self) -> Vec<PortUsage> {
        let mut ports: Vec<PortUsage> =
            self.ports.iter().map(|entry| entry.value().clone()).collect();
        ports.sort_by_key(|u| u.port);
        ports
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let ports = self.port_usage();
        UsageSnapshot {
            status: self.status.get(),
            started_at: self.started_at,
            total_bytes: ports.iter().map(|u| u.bytes).sum(),
            ports,
        }
    }

    /// Write the current snapshot as pretty JSON
    pub async fn write_snapshot(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(&self.snapshot())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(path, json).await
    }

    /// Rewrite the sniffer log periodically, and once more on shutdown
    pub async fn run_sniffer_log(self: Arc<Self>, path: PathBuf, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SNIFFER_LOG_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.write_snapshot(&path).await {
                        warn!("failed to write sniffer log {:?}: {}", path, e);
                    }
                }
            }
        }

        if let Err(e) = self.write_snapshot(&path).await {
            warn!("failed to write sniffer log {:?}: {}", path, e);
        }
        debug!("sniffer log writer stopped");
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(handle_overview))
            .route("/stats", get(handle_stats))
            .with_state(self)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve the dashboard until `cancel` fires
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("usage dashboard listening on http://{}", addr);
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
    }

    pub async fn bind_and_serve(
        self: Arc<Self>,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, cancel).await
    }
}

async fn handle_overview(State(monitor): State<Arc<UsageMonitor>>) -> Json<UsageSnapshot> {
    Json(monitor.snapshot())
}

async fn handle_stats(State(monitor): State<Arc<UsageMonitor>>) -> Json<Vec<PortUsage>> {
    Json(monitor.port_usage())
}
