//! Bidirectional byte relay between two established streams

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Read buffer per direction
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Direction of a relayed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the first stream to the second
    Forward,
    /// From the second stream to the first
    Backward,
}

/// Byte totals for a finished relay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub forward: u64,
    pub backward: u64,
}

/// Copy bytes both ways until either side closes or errors, then close both.
///
/// `on_transfer` is called after every chunk has been written out.
pub async fn relay<A, B, F>(a: A, b: B, on_transfer: F) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
    F: Fn(Direction, usize) + Send + Sync,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let forward = AtomicU64::new(0);
    let backward = AtomicU64::new(0);

    tokio::select! {
        result = transfer(&mut a_read, &mut b_write, Direction::Forward, &forward, &on_transfer) => {
            if let Err(e) = result {
                trace!("relay forward direction ended: {}", e);
            }
        }
        result = transfer(&mut b_read, &mut a_write, Direction::Backward, &backward, &on_transfer) => {
            if let Err(e) = result {
                trace!("relay backward direction ended: {}", e);
            }
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    let stats = RelayStats {
        forward: forward.load(Ordering::Relaxed),
        backward: backward.load(Ordering::Relaxed),
    };
    trace!(
        "relay finished: {} bytes forward, {} bytes backward",
        stats.forward,
        stats.backward
    );
    stats
}

async fn transfer<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    total: &AtomicU64,
    on_transfer: &F,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(Direction, usize),
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            trace!("reader stream closed or EOF received ({:?})", direction);
            return Ok(());
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;

        total.fetch_add(n as u64, Ordering::Relaxed);
        trace!("relayed {} bytes ({:?})", n, direction);
        on_transfer(direction, n);
    }
}
