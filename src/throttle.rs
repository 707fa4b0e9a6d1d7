use std::{
    future::Future,
    io,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep, Sleep},
};

/// A byte stream capped to a maximum amount of bytes per second.
///
/// Every read or write is clipped to `rate` bytes, and moving `n` bytes charges a delay of
/// `n / rate` seconds which must elapse before the next operation in the same direction (or the
/// stream's shutdown) goes through. A rate of 0 makes this a pass-through.
///
/// Errors from the underlying stream are propagated unchanged.
pub struct ThrottledStream<S> {
    inner: S,
    rate: u64,
    read_delay: Option<Pin<Box<Sleep>>>,
    write_delay: Option<Pin<Box<Sleep>>>,
}

impl<S> ThrottledStream<S> {
    pub fn new(inner: S, rate: u64) -> Self {
        Self {
            inner,
            rate,
            read_delay: None,
            write_delay: None,
        }
    }

    fn clip(&self, len: usize) -> usize {
        len.min(usize::try_from(self.rate).unwrap_or(usize::MAX))
    }
}

/// The time it takes to move `bytes` at `rate` bytes per second.
pub fn delay_for(bytes: usize, rate: u64) -> Duration {
    Duration::from_secs_f64(bytes as f64 / rate as f64)
}

fn poll_delay(delay: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> Poll<()> {
    if let Some(sleep) = delay {
        ready!(sleep.as_mut().poll(cx));
        *delay = None;
    }

    Poll::Ready(())
}

impl<S: AsyncRead + Unpin> AsyncRead for ThrottledStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.rate == 0 {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        ready!(poll_delay(&mut this.read_delay, cx));

        let limit = this.clip(buf.remaining());
        let mut clipped = ReadBuf::new(buf.initialize_unfilled_to(limit));
        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut clipped))?;

        let bytes_read = clipped.filled().len();
        buf.advance(bytes_read);
        if bytes_read != 0 {
            this.read_delay = Some(Box::pin(sleep(delay_for(bytes_read, this.rate))));
        }

        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ThrottledStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.rate == 0 {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        ready!(poll_delay(&mut this.write_delay, cx));

        let limit = this.clip(buf.len());
        let bytes_written = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..limit]))?;
        if bytes_written != 0 {
            this.write_delay = Some(Box::pin(sleep(delay_for(bytes_written, this.rate))));
        }

        Poll::Ready(Ok(bytes_written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(poll_delay(&mut this.write_delay, cx));
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
