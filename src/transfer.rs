//! Fixed-size transfer buffers and the pooled copy loop.
//!
//! Regular request and response bodies travel as hyper frames and never touch
//! these buffers. They are used when a connection is upgraded (`101 Switching
//! Protocols`) and the proxy becomes a plain byte relay between client and
//! upstream.

use std::io;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_TRANSFER_SIZE: usize = 32 * 1024;

const MAX_IDLE: usize = 64;

/// A pool of equally sized byte slices for relaying raw bytes.
#[derive(Debug)]
pub struct TransferBufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
    size: usize,
}

impl TransferBufferPool {
    /// A pool of `size`-byte slices. Zero selects [`DEFAULT_TRANSFER_SIZE`].
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { DEFAULT_TRANSFER_SIZE } else { size };
        Self { free: Mutex::new(Vec::new()), size }
    }

    pub fn get(&self) -> Box<[u8]> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size].into_boxed_slice())
    }

    /// Returns a slice to the pool. Slices of a foreign size are dropped.
    pub fn put(&self, buf: Box<[u8]>) {
        if buf.len() != self.size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < MAX_IDLE {
            free.push(buf);
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Default for TransferBufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSFER_SIZE)
    }
}

/// Copies `reader` into `writer` until EOF using one pooled buffer, then
/// shuts the writer down. Returns the number of bytes copied.
pub async fn copy<R, W>(reader: &mut R, writer: &mut W, pool: &TransferBufferPool) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = pool.get();
    let result = copy_with(reader, writer, &mut buf).await;
    pool.put(buf);
    result
}

async fn copy_with<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Relays bytes in both directions until both sides reach EOF.
///
/// Returns `(a_to_b, b_to_a)` byte counts.
pub async fn copy_bidirectional<A, B>(
    a: A,
    b: B,
    pool: &TransferBufferPool,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::try_join!(
        copy(&mut a_read, &mut b_write, pool),
        copy(&mut b_read, &mut a_write, pool),
    )
}
