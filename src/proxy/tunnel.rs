//! Bidirectional relay between client and upstream
//!
//! Two independent copy loops over pooled buffers. When one direction sees
//! EOF the opposite write half is shut down so the peer observes EOF too; the
//! relay resolves once both directions have finished. No deadline applies.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Relay copy buffer size
pub const RELAY_BUF_SIZE: usize = 32 * 1024;

/// Pool of relay buffers, returned on drop
#[derive(Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; RELAY_BUF_SIZE]);
        PooledBuf {
            buf,
            pool: Arc::clone(self),
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// Buffer handle that returns its storage to the pool on drop
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.free.lock().push(std::mem::take(&mut self.buf));
    }
}

/// Copy bytes until EOF or error, then half-close the write side
async fn copy_half<R, W>(mut reader: R, mut writer: W, mut buf: PooledBuf) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                total += n as u64;
            }
        }
    }
    let _ = writer.shutdown().await;
    total
}

/// Copy data bidirectionally between two streams
///
/// Returns the byte counts (client to upstream, upstream to client).
pub async fn copy_bidirectional<C, U>(
    client: C,
    upstream: U,
    buffers: &Arc<BufferPool>,
) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let up = copy_half(client_read, upstream_write, buffers.acquire());
    let down = copy_half(upstream_read, client_write, buffers.acquire());

    let (bytes_sent, bytes_received) = tokio::join!(up, down);

    debug!(
        bytes_sent = bytes_sent,
        bytes_received = bytes_received,
        "Tunnel closed"
    );

    (bytes_sent, bytes_received)
}
