//! Restart supervisor
//!
//! Owns the current generation. A restart cancels it, waits out the grace
//! period and starts a fresh one; at most one restart runs at a time and
//! requests from a generation that is no longer current are ignored.

use crate::acceptor;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::generation::Generation;
use crate::status::TunnelStatus;
use crate::usage::UsageMonitor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Supervisor {
    config: Arc<ServerConfig>,
    status: TunnelStatus,
    usage: Arc<UsageMonitor>,
    shutdown: CancellationToken,
    current: RwLock<Arc<Generation>>,
    restart_lock: Mutex<()>,
    next_id: AtomicU64,
    restarts: AtomicU64,
    fatal_tx: mpsc::UnboundedSender<ServerError>,
}

impl Supervisor {
    /// Create the supervisor with its first (not yet started) generation.
    ///
    /// Fatal errors, such as the tunnel port failing to bind, arrive on the
    /// returned receiver.
    pub fn new(
        config: ServerConfig,
        status: TunnelStatus,
        usage: Arc<UsageMonitor>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerError>) {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let first = Arc::new(Generation::new(0, &shutdown, config.channel_size));

        let supervisor = Arc::new(Self {
            config: Arc::new(config),
            status,
            usage,
            shutdown,
            current: RwLock::new(first),
            restart_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            restarts: AtomicU64::new(0),
            fatal_tx,
        });
        (supervisor, fatal_rx)
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn status(&self) -> &TunnelStatus {
        &self.status
    }

    pub fn usage(&self) -> &Arc<UsageMonitor> {
        &self.usage
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn current_generation(&self) -> Arc<Generation> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of completed restarts
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Start serving the current generation
    pub fn start(self: &Arc<Self>) {
        self.launch(self.current_generation());
    }

    fn launch(self: &Arc<Self>, generation: Arc<Generation>) {
        info!("starting generation {}", generation.id());
        tokio::spawn(acceptor::run_tunnel_acceptor(self.clone(), generation));
    }

    /// Request a restart on behalf of `generation` without waiting for it
    pub fn trigger_restart(self: &Arc<Self>, generation: &Generation) {
        let supervisor = self.clone();
        let generation_id = generation.id();
        tokio::spawn(async move {
            supervisor.restart(generation_id).await;
        });
    }

    /// Tear down `generation_id` and start its successor.
    ///
    /// No-op if another restart is running, if `generation_id` is stale, or
    /// if the process is shutting down.
    pub async fn restart(self: &Arc<Self>, generation_id: u64) {
        let Ok(_guard) = self.restart_lock.try_lock() else {
            warn!("server restart already in progress, skipping restart attempt");
            return;
        };

        let current = self.current_generation();
        if current.id() != generation_id || current.is_cancelled() {
            debug!(
                "ignoring restart request from generation {} (current is {})",
                generation_id,
                current.id()
            );
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        info!("restarting server...");
        current.shutdown();
        self.status.clear();

        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.config.restart_grace) => {}
        }

        let next = Arc::new(Generation::new(
            self.next_id.fetch_add(1, Ordering::SeqCst),
            &self.shutdown,
            self.config.channel_size,
        ));
        match self.current.write() {
            Ok(mut guard) => *guard = next.clone(),
            Err(poisoned) => *poisoned.into_inner() = next.clone(),
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.launch(next);
    }

    /// Report an error that should stop the server
    pub fn report_fatal(&self, err: ServerError) {
        error!("{}", err);
        if self.fatal_tx.send(err).is_err() {
            debug!("fatal error reported after the server stopped");
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("generation", &self.current_generation().id())
            .field("restarts", &self.restart_count())
            .field("status", &self.status.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use std::time::Duration;

    fn test_config() -> ServerConfig {
        let mut config = TunnelConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            token: "secret".to_string(),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        config.restart_grace = Duration::from_millis(50);
        config
    }

    fn supervisor(shutdown: CancellationToken) -> Arc<Supervisor> {
        let status = TunnelStatus::new();
        let usage = Arc::new(UsageMonitor::new(status.clone()));
        let (supervisor, _fatal_rx) = Supervisor::new(test_config(), status, usage, shutdown);
        supervisor
    }

    #[tokio::test]
    async fn test_concurrent_restarts_run_once() {
        let shutdown = CancellationToken::new();
        let supervisor = supervisor(shutdown.clone());
        let first = supervisor.current_generation();

        let a = supervisor.clone();
        let b = supervisor.clone();
        tokio::join!(a.restart(first.id()), b.restart(first.id()));

        assert_eq!(supervisor.restart_count(), 1);
        assert!(first.is_cancelled());
        assert!(first.pool().is_closed());
        let second = supervisor.current_generation();
        assert_ne!(second.id(), first.id());
        assert!(!second.is_cancelled());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stale_restart_ignored() {
        let shutdown = CancellationToken::new();
        let supervisor = supervisor(shutdown.clone());
        let first = supervisor.current_generation();

        supervisor.restart(first.id()).await;
        assert_eq!(supervisor.restart_count(), 1);

        // A late request from the dead generation does nothing
        supervisor.restart(first.id()).await;
        assert_eq!(supervisor.restart_count(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_restart_skipped_during_shutdown() {
        let shutdown = CancellationToken::new();
        let supervisor = supervisor(shutdown.clone());

        shutdown.cancel();
        let first = supervisor.current_generation();
        supervisor.restart(first.id()).await;
        assert_eq!(supervisor.restart_count(), 0);
    }

    #[tokio::test]
    async fn test_new_generation_is_child_of_shutdown() {
        let shutdown = CancellationToken::new();
        let supervisor = supervisor(shutdown.clone());
        let first = supervisor.current_generation();
        supervisor.restart(first.id()).await;

        let second = supervisor.current_generation();
        shutdown.cancel();
        assert!(second.is_cancelled());
    }
}
