//! A yamux session driven by a background task.
//!
//! A [`yamux::Connection`] only makes progress while it is being polled, so the connection is
//! owned by a single driver task which keeps polling it for inbound streams, hands outbound
//! streams to whoever asked for them, and closes it on request.

use std::{
    collections::VecDeque,
    future::{poll_fn, Future},
    task::Poll,
};

use futures::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use yamux::{Config, Connection, ConnectionError, Mode, Stream};

use crate::error::{Result, TunnelError};

/// The most streams a single session may carry at once.
pub const MAX_STREAMS: usize = 1024;

/// How many accepted streams may wait for [`YamuxSession::accept_stream`] before new ones are
/// refused.
const INBOUND_BACKLOG: usize = 256;

type OutboundReply = oneshot::Sender<Stream>;

/// The yamux configuration used by both ends of a tunnel: every stream gets the default 256 KiB
/// receive window, and the connection as a whole is capped to exactly that per stream.
pub fn tunnel_config() -> Config {
    let mut config = Config::default();
    config.set_max_connection_receive_window(Some(MAX_STREAMS * yamux::DEFAULT_CREDIT as usize));
    config.set_max_num_streams(MAX_STREAMS);
    config
}

pub struct YamuxSession {
    outbound: mpsc::Sender<OutboundReply>,
    inbound: Mutex<mpsc::Receiver<Stream>>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl YamuxSession {
    /// Starts a yamux session over `socket` and spawns the task driving it.
    pub fn new<T>(socket: T, mode: Mode) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Connection::new(socket, tunnel_config(), mode);
        let (outbound_tx, outbound_rx) = mpsc::channel(INBOUND_BACKLOG);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BACKLOG);
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        let driver_shutdown = shutdown.clone();
        let driver_closed = closed.clone();
        tokio::spawn(async move {
            match drive(connection, outbound_rx, inbound_tx, driver_shutdown).await {
                Ok(()) => debug!("Multiplexed session closed"),
                Err(error) => debug!("Multiplexed session ended with error: {error}"),
            }

            driver_closed.cancel();
        });

        Self {
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            shutdown,
            closed,
        }
    }

    pub async fn open_stream(&self) -> Result<Stream> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.outbound.send(reply_tx).await.map_err(|_| TunnelError::SessionClosed)?;
        reply_rx.await.map_err(|_| TunnelError::SessionClosed)
    }

    pub async fn accept_stream(&self) -> Result<Stream> {
        self.inbound.lock().await.recv().await.ok_or(TunnelError::SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn drive<T>(
    mut connection: Connection<T>,
    mut outbound: mpsc::Receiver<OutboundReply>,
    inbound: mpsc::Sender<Stream>,
    shutdown: CancellationToken,
) -> std::result::Result<(), ConnectionError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut pending: VecDeque<OutboundReply> = VecDeque::new();
    let shutdown_requested = shutdown.cancelled();
    tokio::pin!(shutdown_requested);

    let close_locally = poll_fn(|cx| {
        if shutdown_requested.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(true));
        }

        while let Poll::Ready(Some(reply)) = outbound.poll_recv(cx) {
            pending.push_back(reply);
        }

        while !pending.is_empty() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(reply) = pending.pop_front() {
                        // The requester may have given up waiting, in which case the stream is
                        // dropped and reset.
                        let _ = reply.send(stream);
                    }
                }
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Pending => break,
            }
        }

        loop {
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    if let Err(error) = inbound.try_send(stream) {
                        warn!("Refusing inbound stream: {error}");
                    }
                }
                Poll::Ready(Some(Err(error))) => return Poll::Ready(Err(error)),
                Poll::Ready(None) => return Poll::Ready(Ok(false)),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await?;

    if close_locally {
        poll_fn(|cx| connection.poll_close(cx)).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;

    fn session_pair() -> (YamuxSession, YamuxSession) {
        let (a, b) = tokio::io::duplex(0x10000);
        (YamuxSession::new(a.compat(), Mode::Client), YamuxSession::new(b.compat(), Mode::Server))
    }

    #[test]
    fn test_config_accepts_stream_limit() {
        // Config setters assert the window covers every stream.
        let _ = tunnel_config();
    }

    #[tokio::test]
    async fn test_open_and_accept() {
        let (server, client) = session_pair();

        let mut opened = server.open_stream().await.unwrap();
        opened.write_all(b"hello").await.unwrap();
        opened.flush().await.unwrap();

        let mut accepted = client.accept_stream().await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        accepted.write_all(b"world").await.unwrap();
        accepted.flush().await.unwrap();
        opened.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_closing_one_stream_keeps_session() {
        let (server, client) = session_pair();

        let mut first = server.open_stream().await.unwrap();
        first.write_all(b"1").await.unwrap();
        first.close().await.unwrap();
        let mut accepted = client.accept_stream().await.unwrap();
        let mut buf = Vec::new();
        accepted.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"1");

        let mut second = server.open_stream().await.unwrap();
        second.write_all(b"2").await.unwrap();
        second.flush().await.unwrap();
        let mut accepted = client.accept_stream().await.unwrap();
        let mut buf = [0u8; 1];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"2");

        assert!(!server.is_closed());
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_close_propagates() {
        let (server, client) = session_pair();

        server.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), client.closed()).await.unwrap();
        server.closed().await;

        assert!(server.is_closed());
        assert!(client.is_closed());
        assert!(matches!(client.accept_stream().await, Err(TunnelError::SessionClosed)));
        assert!(matches!(server.open_stream().await, Err(TunnelError::SessionClosed)));
    }
}
