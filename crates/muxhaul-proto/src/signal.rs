//! Control channel signals

use std::fmt;

/// Fixed signals exchanged over the control channel.
///
/// Wire encoding (one signal frame each):
///
/// | Signal       | Payload    | Direction       |
/// |--------------|------------|-----------------|
/// | `Heartbeat`  | `"0"`      | server -> agent |
/// | `BatchReady` | `"1"`      | server -> agent |
/// | `Closed`     | `"closed"` | agent -> server |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Periodic liveness pulse
    Heartbeat,
    /// A session filled its batch; the agent should open another tunnel connection
    BatchReady,
    /// The agent is shutting down gracefully
    Closed,
}

impl Signal {
    pub const HEARTBEAT: &'static str = "0";
    pub const BATCH_READY: &'static str = "1";
    pub const CLOSED: &'static str = "closed";

    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Heartbeat => Self::HEARTBEAT,
            Signal::BatchReady => Self::BATCH_READY,
            Signal::Closed => Self::CLOSED,
        }
    }

    /// Parse a received payload. Unknown payloads yield `None`.
    pub fn parse(payload: &str) -> Option<Self> {
        match payload {
            Self::HEARTBEAT => Some(Signal::Heartbeat),
            Self::BATCH_READY => Some(Signal::BatchReady),
            Self::CLOSED => Some(Signal::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
