//! Shared tunnel status string

use std::sync::{Arc, RwLock};

pub const STATUS_DISCONNECTED: &str = "Disconnected (TCPMux)";
pub const STATUS_CONNECTED: &str = "Connected (TCPMux)";

/// Human-readable tunnel state, shared between the supervisor and the dashboard.
///
/// Empty while a restart is in progress.
#[derive(Debug, Clone, Default)]
pub struct TunnelStatus(Arc<RwLock<String>>);

impl TunnelStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, status: impl Into<String>) {
        let status = status.into();
        match self.0.write() {
            Ok(mut guard) => *guard = status,
            Err(poisoned) => *poisoned.into_inner() = status,
        }
    }

    pub fn get(&self) -> String {
        match self.0.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn clear(&self) {
        self.set(String::new());
    }
}
