//! Copies bytes between a logical stream and a raw socket.

use std::{
    io,
    ops::{Deref, DerefMut},
    sync::{Mutex, OnceLock},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    time::sleep,
};
use tracing::trace;

use crate::{
    stats::{Direction, TunnelStats},
    throttle::delay_for,
};

/// The size of every buffer handed out by the [`BufferPool`].
pub const BUFFER_SIZE: usize = 32 * 1024;

/// How many idle buffers the global pool keeps around for reuse.
const MAX_IDLE_BUFFERS: usize = 256;

/// A pool of fixed-size byte buffers, shared across all pump tasks.
pub struct BufferPool {
    idle: Mutex<Vec<Box<[u8]>>>,
    buffer_size: usize,
    max_idle: usize,
}

impl BufferPool {
    pub const fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            buffer_size,
            max_idle,
        }
    }

    /// The process-wide pool of [`BUFFER_SIZE`] buffers.
    pub fn global() -> &'static BufferPool {
        static POOL: OnceLock<BufferPool> = OnceLock::new();
        POOL.get_or_init(|| BufferPool::new(BUFFER_SIZE, MAX_IDLE_BUFFERS))
    }

    pub fn acquire(&self) -> PooledBuffer<'_> {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let buf = reused.unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());
        PooledBuffer { pool: self, buf }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn release(&self, buf: Box<[u8]>) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(buf);
            }
        }
    }
}

/// A buffer borrowed from a [`BufferPool`], returned to it when dropped.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Box<[u8]>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

/// How a single pump direction ended.
#[derive(Debug)]
pub struct PumpOutcome {
    /// The amount of bytes read from the source and written to the destination.
    pub bytes: u64,

    /// The error that stopped the pump, or `None` if the source reached end-of-stream.
    pub error: Option<io::Error>,
}

impl PumpOutcome {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Copies bytes from `src` to `dst` until either side reaches end-of-stream or fails.
///
/// The bytes of every read are added to `counter` before being written. If `rate` is non-zero,
/// writes are split into chunks of at most `rate` bytes and each chunk of `m` bytes is followed
/// by a sleep of `m / rate` seconds.
pub async fn pump<R, W>(dst: &mut W, src: &mut R, counter: Option<(&TunnelStats, Direction)>, rate: u64) -> PumpOutcome
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let pool = BufferPool::global();
    let chunk_size = match rate {
        0 => BUFFER_SIZE,
        rate => usize::try_from(rate).unwrap_or(usize::MAX).min(BUFFER_SIZE),
    };

    let mut total = 0u64;
    loop {
        let mut buf = pool.acquire();
        let bytes_read = match src.read(&mut buf).await {
            Ok(0) => return PumpOutcome { bytes: total, error: None },
            Ok(n) => n,
            Err(error) => return PumpOutcome { bytes: total, error: Some(error) },
        };

        if let Some((stats, direction)) = counter {
            stats.record_bytes(direction, bytes_read as u64);
        }

        for chunk in buf[..bytes_read].chunks(chunk_size) {
            if let Err(error) = write_chunk(dst, chunk).await {
                return PumpOutcome { bytes: total, error: Some(error) };
            }

            total += chunk.len() as u64;
            if rate != 0 {
                sleep(delay_for(chunk.len(), rate)).await;
            }
        }
    }
}

async fn write_chunk<W: AsyncWrite + Unpin + ?Sized>(dst: &mut W, chunk: &[u8]) -> io::Result<()> {
    dst.write_all(chunk).await?;
    dst.flush().await
}

/// How a bound stream pair ended, one [`PumpOutcome`] per direction.
#[derive(Debug)]
pub struct PairOutcome {
    pub a_to_b: PumpOutcome,
    pub b_to_a: PumpOutcome,
}

/// Runs a pump in each direction between `a` and `b`.
///
/// When a direction reaches end-of-stream, the write half it was feeding is shut down and the
/// other direction is left to drain. When a direction fails, the other one is abandoned. Both
/// streams are dropped, and so closed, once this returns.
pub async fn forward_pair<A, B>(a: A, b: B, a_to_b: Direction, stats: Option<&TunnelStats>, rate: u64) -> PairOutcome
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let b_to_a = match a_to_b {
        Direction::Inbound => Direction::Outbound,
        Direction::Outbound => Direction::Inbound,
    };

    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let forward = pump_half(&mut b_write, &mut a_read, stats.map(|s| (s, a_to_b)), rate);
    let backward = pump_half(&mut a_write, &mut b_read, stats.map(|s| (s, b_to_a)), rate);
    tokio::pin!(forward, backward);

    select! {
        outcome = &mut forward => {
            let other = match outcome.is_clean() {
                true => backward.await,
                false => aborted(),
            };
            PairOutcome { a_to_b: outcome, b_to_a: other }
        }
        outcome = &mut backward => {
            let other = match outcome.is_clean() {
                true => forward.await,
                false => aborted(),
            };
            PairOutcome { a_to_b: other, b_to_a: outcome }
        }
    }
}

async fn pump_half<R, W>(dst: &mut W, src: &mut R, counter: Option<(&TunnelStats, Direction)>, rate: u64) -> PumpOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut outcome = pump(dst, src, counter, rate).await;
    if outcome.is_clean() {
        if let Err(error) = dst.shutdown().await {
            trace!("Shutting down write half after end-of-stream failed: {error}");
            outcome.error = Some(error);
        }
    }

    outcome
}

fn aborted() -> PumpOutcome {
    PumpOutcome {
        bytes: 0,
        error: Some(io::Error::new(io::ErrorKind::ConnectionAborted, "the opposite direction failed")),
    }
}
