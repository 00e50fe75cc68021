//! One lifetime of the tunnel pipeline
//!
//! Every restart builds a fresh `Generation`: a new cancellation scope, a new
//! empty tunnel pool and an empty control slot. Nothing carries over.

use crate::control::ControlChannel;
use muxhaul_transport::BoundedQueue;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub struct Generation {
    id: u64,
    cancel: CancellationToken,
    pool: BoundedQueue<TcpStream>,
    control: ControlSlot,
}

impl Generation {
    /// Create a generation whose scope is a child of `parent`
    pub fn new(id: u64, parent: &CancellationToken, pool_capacity: usize) -> Self {
        Self {
            id,
            cancel: parent.child_token(),
            pool: BoundedQueue::new(pool_capacity),
            control: ControlSlot::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Pooled raw tunnel connections waiting to become mux sessions
    pub fn pool(&self) -> &BoundedQueue<TcpStream> {
        &self.pool
    }

    pub fn control(&self) -> &ControlSlot {
        &self.control
    }

    /// Cancel every task of this generation and drop pooled connections
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.pool.close();
        self.control.clear();
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("pool", &self.pool)
            .field("control", &self.control.peer_ip())
            .finish()
    }
}

/// Holder for the single authenticated control channel of a generation
#[derive(Default)]
pub struct ControlSlot {
    inner: RwLock<Option<Arc<ControlChannel>>>,
}

impl ControlSlot {
    /// Install a channel unless one is already present.
    ///
    /// On conflict the rejected channel is handed back.
    pub fn install(&self, channel: Arc<ControlChannel>) -> Result<(), Arc<ControlChannel>> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return Err(channel);
        }
        *guard = Some(channel);
        Ok(())
    }

    pub fn get(&self) -> Option<Arc<ControlChannel>> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.get().is_some()
    }

    /// IP of the agent that owns the control channel
    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.get().map(|channel| channel.peer_addr().ip())
    }

    fn clear(&self) {
        let taken = match self.inner.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(taken);
    }
}
