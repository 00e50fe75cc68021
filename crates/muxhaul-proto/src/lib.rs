//! Muxhaul wire protocol
//!
//! Length-prefixed signal framing shared by the control channel and the
//! per-stream target announcement, plus the tagged set of control signals.

pub mod codec;
pub mod signal;

pub use codec::{receive_signal, send_signal, CodecError, SignalCodec};
pub use signal::Signal;

/// Size of the frame length prefix in bytes (big-endian u16)
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest payload a single signal frame can carry
pub const MAX_SIGNAL_LEN: usize = u16::MAX as usize;
