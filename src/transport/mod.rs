//! Encrypted transports carrying multiplexed logical streams between a tunnel server and client.
//!
//! Both variants expose the same contract through [`TunnelSession`]: open a stream, accept a
//! stream, check or await closure, close. Servers get sessions from a [`TunnelListener`], clients
//! dial them with a [`TunnelConnector`].

use std::{
    fmt, io,
    net::SocketAddr,
    pin::Pin,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use url::Url;

use crate::error::{Result, TunnelError};

use self::{quic::QuicSession, tls::TlsMaterial, yamux::YamuxSession};

pub mod quic;
pub mod tls;
pub mod websocket;
pub mod yamux;

/// The byte the opener of a logical stream writes first, so the peer learns about the stream
/// right away.
pub const STREAM_PREAMBLE: u8 = 0xA5;

/// How long an accepted stream may take to deliver its preamble.
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

/// How many established sessions may wait in a [`TunnelListener`] before handshakes block.
const SESSION_BACKLOG: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// WebSocket over TLS, multiplexed with yamux.
    WebSocket,

    /// Native QUIC streams.
    Quic,
}

impl TransportKind {
    /// The transport a client dials for `url`: `wss://` for WebSocket and `quic://` for QUIC.
    pub fn from_url(url: &Url) -> Result<Self> {
        match url.scheme() {
            "wss" => Ok(Self::WebSocket),
            "quic" => Ok(Self::Quic),
            other => Err(TunnelError::Config(format!(
                "Unsupported URL scheme {other:?}, expected \"wss\" or \"quic\""
            ))),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ws" | "wss" | "websocket" => Ok(Self::WebSocket),
            "quic" => Ok(Self::Quic),
            _ => Err(format!("Unknown transport: {s}")),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "websocket"),
            Self::Quic => write!(f, "quic"),
        }
    }
}

enum SessionInner {
    Multiplexed(YamuxSession),
    Quic(QuicSession),
}

/// One established transport connection between a tunnel server and a tunnel client.
///
/// Dropping a session does not close it. Streams already opened on it keep working until they
/// end or the peer goes away; call [`close`](Self::close) to tear it down explicitly.
pub struct TunnelSession {
    id: u64,
    kind: TransportKind,
    remote_addr: SocketAddr,
    established_at: Instant,
    inner: SessionInner,
}

fn next_session_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

impl TunnelSession {
    fn new(inner: SessionInner, kind: TransportKind, remote_addr: SocketAddr) -> Self {
        Self {
            id: next_session_id(),
            kind,
            remote_addr,
            established_at: Instant::now(),
            inner,
        }
    }

    pub(crate) fn websocket(session: YamuxSession, remote_addr: SocketAddr) -> Self {
        Self::new(SessionInner::Multiplexed(session), TransportKind::WebSocket, remote_addr)
    }

    pub(crate) fn quic(session: QuicSession, remote_addr: SocketAddr) -> Self {
        Self::new(SessionInner::Quic(session), TransportKind::Quic, remote_addr)
    }

    /// A process-unique identifier for this session.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    /// Opens a new logical stream, announcing it to the peer.
    pub async fn open_stream(&self) -> Result<LogicalStream> {
        let mut stream = match &self.inner {
            SessionInner::Multiplexed(session) => LogicalStream::multiplexed(session.open_stream().await?),
            SessionInner::Quic(session) => {
                let (send, recv) = session.open_stream().await?;
                LogicalStream::quic(send, recv)
            }
        };

        stream.write_all(&[STREAM_PREAMBLE]).await?;
        stream.flush().await?;
        Ok(stream)
    }

    /// Waits for the peer to open a logical stream. Its preamble is left unread, so one slow
    /// stream can't hold up the next: call [`LogicalStream::expect_preamble`] before using it.
    pub async fn accept_stream(&self) -> Result<LogicalStream> {
        match &self.inner {
            SessionInner::Multiplexed(session) => Ok(LogicalStream::multiplexed(session.accept_stream().await?)),
            SessionInner::Quic(session) => {
                let (send, recv) = session.accept_stream().await?;
                Ok(LogicalStream::quic(send, recv))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.inner {
            SessionInner::Multiplexed(session) => session.is_closed(),
            SessionInner::Quic(session) => session.is_closed(),
        }
    }

    /// Waits until the session is closed, by either side or by a dead network path.
    pub async fn closed(&self) {
        match &self.inner {
            SessionInner::Multiplexed(session) => session.closed().await,
            SessionInner::Quic(session) => session.closed().await,
        }
    }

    pub fn close(&self) {
        match &self.inner {
            SessionInner::Multiplexed(session) => session.close(),
            SessionInner::Quic(session) => session.close(),
        }
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

enum StreamInner {
    Multiplexed(Compat<::yamux::Stream>),
    Quic { send: quinn::SendStream, recv: quinn::RecvStream },
}

/// One bidirectional byte channel within a [`TunnelSession`]. Dropping it closes the stream only.
pub struct LogicalStream {
    id: u64,
    inner: StreamInner,
}

impl LogicalStream {
    fn multiplexed(stream: ::yamux::Stream) -> Self {
        Self {
            id: u64::from(stream.id().val()),
            inner: StreamInner::Multiplexed(stream.compat()),
        }
    }

    fn quic(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        Self {
            id: send.id().index(),
            inner: StreamInner::Quic { send, recv },
        }
    }

    /// The transport-assigned identifier of this stream.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Reads the byte the opener writes first and checks it, waiting at most
    /// [`PREAMBLE_TIMEOUT`].
    pub async fn expect_preamble(&mut self) -> Result<()> {
        match timeout(PREAMBLE_TIMEOUT, self.read_u8()).await {
            Ok(Ok(STREAM_PREAMBLE)) => Ok(()),
            Ok(Ok(other)) => Err(TunnelError::Handshake(format!("Unexpected stream preamble {other:#04x}"))),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(TunnelError::Handshake("Stream preamble timed out".to_string())),
        }
    }
}

impl AsyncRead for LogicalStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            StreamInner::Multiplexed(stream) => AsyncRead::poll_read(Pin::new(stream), cx, buf),
            StreamInner::Quic { recv, .. } => AsyncRead::poll_read(Pin::new(recv), cx, buf),
        }
    }
}

impl AsyncWrite for LogicalStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            StreamInner::Multiplexed(stream) => AsyncWrite::poll_write(Pin::new(stream), cx, buf),
            StreamInner::Quic { send, .. } => AsyncWrite::poll_write(Pin::new(send), cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            StreamInner::Multiplexed(stream) => AsyncWrite::poll_flush(Pin::new(stream), cx),
            StreamInner::Quic { send, .. } => AsyncWrite::poll_flush(Pin::new(send), cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            StreamInner::Multiplexed(stream) => AsyncWrite::poll_shutdown(Pin::new(stream), cx),
            StreamInner::Quic { send, .. } => AsyncWrite::poll_shutdown(Pin::new(send), cx),
        }
    }
}

/// Where and how a [`TunnelListener`] accepts tunnel connections.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    pub addr: SocketAddr,
    pub kind: TransportKind,

    /// The HTTP path upgraded to WebSocket.
    pub path: String,

    /// The ALPN protocol QUIC clients must present.
    pub secret: Option<String>,
}

/// Accepts tunnel sessions in a background task. Dropping the listener stops accepting but
/// leaves established sessions alone.
pub struct TunnelListener {
    local_addr: SocketAddr,
    sessions: mpsc::Receiver<TunnelSession>,
    task: JoinHandle<()>,
}

impl TunnelListener {
    pub async fn bind(options: &ListenOptions, material: &TlsMaterial) -> Result<Self> {
        let (tx, sessions) = mpsc::channel(SESSION_BACKLOG);
        let (local_addr, task) = match options.kind {
            TransportKind::WebSocket => websocket::listen(options.addr, material, &options.path, tx).await?,
            TransportKind::Quic => {
                let secret = non_empty_secret(options.secret.as_deref())?;
                quic::listen(options.addr, material, secret, tx)?
            }
        };

        Ok(Self {
            local_addr,
            sessions,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next established session. Returns `None` if the accept task stopped.
    pub async fn accept(&mut self) -> Option<TunnelSession> {
        self.sessions.recv().await
    }
}

impl Drop for TunnelListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn non_empty_secret(secret: Option<&str>) -> Result<&str> {
    match secret {
        Some(secret) if !secret.is_empty() => Ok(secret),
        _ => Err(TunnelError::Config("The QUIC transport requires a secret".to_string())),
    }
}

/// Dials tunnel sessions to one server.
#[derive(Debug, Clone)]
pub struct TunnelConnector {
    url: Url,
    kind: TransportKind,
    secret: Option<String>,
}

impl TunnelConnector {
    /// Creates a connector for `url`, whose scheme picks the transport.
    pub fn new(url: Url, secret: Option<String>) -> Result<Self> {
        let kind = TransportKind::from_url(&url)?;
        if kind == TransportKind::Quic {
            non_empty_secret(secret.as_deref())?;
        }

        Ok(Self { url, kind, secret })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn connect(&self) -> Result<TunnelSession> {
        match self.kind {
            TransportKind::WebSocket => websocket::connect(&self.url).await,
            TransportKind::Quic => quic::connect(&self.url, non_empty_secret(self.secret.as_deref())?).await,
        }
    }
}
