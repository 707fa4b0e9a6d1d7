//! The WebSocket-over-TLS transport.
//!
//! The server terminates TLS, answers plain HTTP for anything but the tunnel path, and upgrades
//! requests to the tunnel path into a WebSocket. Each WebSocket is bridged into a plain byte
//! stream which then carries a yamux session.

use std::{io, net::SocketAddr, time::Duration};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{
        header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE},
        HeaderMap, HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use futures::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use tokio::{
    io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, timeout, Instant},
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::{
    client_async,
    tungstenite::{client::IntoClientRequest, handshake::derive_accept_key, protocol::Role, Bytes, Message},
    WebSocketStream,
};
use tokio_util::compat::TokioAsyncReadCompatExt;
use tower::Service;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    tls::{self, TlsMaterial},
    yamux::YamuxSession,
    TunnelSession,
};
use crate::error::{Result, TunnelError};

/// The only WebSocket subprotocol a tunnel handshake may negotiate.
pub const SUBPROTOCOL: &str = "tunnel";

/// How often a ping is sent to keep the connection alive.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// How long the connection may go without receiving anything before it's considered dead.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long sending a single message may take before the connection is considered dead.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a client has to complete the TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The buffer size of the byte stream bridged from a WebSocket, and so the largest message sent.
const BRIDGE_BUFFER_SIZE: usize = 64 * 1024;

/// Checks that `path` can be served as the tunnel path: it must start with `/` and contain only
/// unreserved URL characters.
pub fn validate_path(path: &str) -> Result<()> {
    let valid = path.starts_with('/')
        && path
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'-' | b'_' | b'.' | b'~'));

    match valid {
        true => Ok(()),
        false => Err(TunnelError::Config(format!("Invalid tunnel path: {path:?}"))),
    }
}

#[derive(Clone)]
struct UpgradeState {
    sessions: mpsc::Sender<TunnelSession>,
}

/// The router answering every HTTP request on the tunnel port. Only upgrade requests to `path`
/// become sessions; everything else gets a 404 as if no tunnel existed.
pub fn router(path: &str, sessions: mpsc::Sender<TunnelSession>) -> Router {
    Router::new()
        .route(path, any(upgrade_handler))
        .fallback(not_found)
        .with_state(UpgradeState { sessions })
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn upgrade_handler(
    State(state): State<UpgradeState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let key = match validate_upgrade(request.method(), request.headers()) {
        Ok(key) => key,
        Err(reason) => {
            debug!("Rejecting tunnel handshake from {remote_addr}: {reason}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let accept_key = derive_accept_key(key.as_bytes());
    let on_upgrade = hyper::upgrade::on(request);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(error) => {
                warn!("WebSocket upgrade from {remote_addr} failed: {error}");
                return;
            }
        };

        let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        let session = YamuxSession::new(bridge(ws).compat(), yamux::Mode::Server);
        let session = TunnelSession::websocket(session, remote_addr);
        info!("WebSocket tunnel established with {remote_addr} (session {})", session.id());

        if state.sessions.send(session).await.is_err() {
            debug!("Tunnel listener is gone, dropping session from {remote_addr}");
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    if let Ok(value) = HeaderValue::from_str(&accept_key) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, value);
    }

    response
}

fn header_has_token(headers: &HeaderMap, name: impl axum::http::header::AsHeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Checks that a request is a WebSocket upgrade offering the tunnel subprotocol, returning its
/// `Sec-WebSocket-Key`.
fn validate_upgrade(method: &Method, headers: &HeaderMap) -> std::result::Result<String, &'static str> {
    if method != Method::GET {
        return Err("method is not GET");
    }

    if !header_has_token(headers, CONNECTION, "upgrade") || !header_has_token(headers, UPGRADE, "websocket") {
        return Err("not an upgrade request");
    }

    if headers.get(SEC_WEBSOCKET_VERSION).and_then(|v| v.to_str().ok()) != Some("13") {
        return Err("unsupported WebSocket version");
    }

    if !header_has_token(headers, SEC_WEBSOCKET_PROTOCOL, SUBPROTOCOL) {
        return Err("tunnel subprotocol not offered");
    }

    headers
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(|key| key.to_string())
        .ok_or("missing Sec-WebSocket-Key")
}

/// Binds the tunnel port and spawns the task accepting TLS connections on it. Established
/// sessions are sent through `sessions`.
pub async fn listen(
    addr: SocketAddr,
    material: &TlsMaterial,
    path: &str,
    sessions: mpsc::Sender<TunnelSession>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    validate_path(path)?;
    let acceptor = TlsAcceptor::from(tls::websocket_server_config(material)?);
    let listener = TcpListener::bind(addr).await.map_err(|source| TunnelError::Bind {
        what: "tunnel",
        addr,
        source,
    })?;
    let local_addr = listener.local_addr()?;
    let router = router(path, sessions);

    let handle = tokio::spawn(async move {
        loop {
            let (tcp_stream, remote_addr) = match listener.accept().await {
                Ok(t) => t,
                Err(error) => {
                    warn!("Error accepting incoming tunnel connection: {error}");
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let router = router.clone();
            tokio::spawn(async move {
                serve_connection(tcp_stream, remote_addr, acceptor, router).await;
            });
        }
    });

    Ok((local_addr, handle))
}

async fn serve_connection(tcp_stream: TcpStream, remote_addr: SocketAddr, acceptor: TlsAcceptor, router: Router) {
    let tls_stream = match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp_stream)).await {
        Ok(Ok(s)) => s,
        Ok(Err(error)) => {
            debug!("TLS handshake with {remote_addr} failed: {error}");
            return;
        }
        Err(_) => {
            debug!("TLS handshake with {remote_addr} timed out");
            return;
        }
    };

    let io = TokioIo::new(tls_stream);
    let hyper_service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(remote_addr));
        router.clone().call(request)
    });

    if let Err(error) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, hyper_service)
        .await
    {
        debug!("HTTP connection with {remote_addr} ended with error: {error}");
    }
}

/// Dials a tunnel server at `url` (`wss://host:port/path`), returning the established session.
pub async fn connect(url: &Url) -> Result<TunnelSession> {
    let host = url
        .host_str()
        .ok_or_else(|| TunnelError::InvalidAddress(format!("{url} has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| TunnelError::InvalidAddress(format!("{url} has no port")))?;

    let tcp_stream = TcpStream::connect((host.trim_start_matches('[').trim_end_matches(']'), port)).await?;
    let remote_addr = tcp_stream.peer_addr()?;
    tcp_stream.set_nodelay(true)?;

    let connector = TlsConnector::from(tls::websocket_client_config());
    let tls_stream = connector.connect(tls::server_name(host), tcp_stream).await?;

    let mut request = url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

    let (ws, _response) = client_async(request, tls_stream).await?;
    let session = YamuxSession::new(bridge(ws).compat(), yamux::Mode::Client);
    Ok(TunnelSession::websocket(session, remote_addr))
}

/// Turns a WebSocket into a plain byte stream, carried as binary messages.
///
/// A background task moves the bytes and keeps the connection alive with periodic pings. The
/// returned stream reaches end-of-stream when the WebSocket closes, nothing is received for
/// [`IDLE_TIMEOUT`], or sending a message takes longer than [`WRITE_TIMEOUT`].
pub fn bridge<S>(ws: WebSocketStream<S>) -> DuplexStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (local, remote) = duplex(BRIDGE_BUFFER_SIZE);
    tokio::spawn(async move {
        match run_bridge(ws, remote).await {
            Ok(()) => debug!("WebSocket closed"),
            Err(error) => debug!("WebSocket closed with error: {error}"),
        }
    });

    local
}

fn ws_error(error: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, error)
}

async fn run_bridge<S>(ws: WebSocketStream<S>, remote: DuplexStream) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = ws.split();
    let (mut reader, mut writer) = tokio::io::split(remote);

    let inbound = async {
        loop {
            let message = match timeout(IDLE_TIMEOUT, source.next()).await {
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "keep-alive timed out")),
                Ok(None) => return Ok(()),
                Ok(Some(result)) => result.map_err(ws_error)?,
            };

            match message {
                Message::Binary(data) => writer.write_all(&data).await?,
                Message::Close(_) => return Ok(()),
                Message::Text(_) => return Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected text message")),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    };

    let outbound = async {
        let mut keepalive = interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
        let mut buf = vec![0u8; BRIDGE_BUFFER_SIZE];
        loop {
            let message = select! {
                result = reader.read(&mut buf) => match result? {
                    0 => break,
                    n => Message::binary(buf[..n].to_vec()),
                },
                _ = keepalive.tick() => Message::Ping(Bytes::new()),
            };

            match timeout(WRITE_TIMEOUT, sink.send(message)).await {
                Ok(result) => result.map_err(ws_error)?,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
            }
        }

        let _ = timeout(WRITE_TIMEOUT, sink.close()).await;
        Ok(())
    };

    select! {
        result = inbound => result,
        result = outbound => result,
    }
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;

    fn upgrade_request(uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .uri(uri)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(SEC_WEBSOCKET_PROTOCOL, SUBPROTOCOL)
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/connect").is_ok());
        assert!(validate_path("/a1b2c3d4e5f60718").is_ok());
        assert!(validate_path("/nested/path-1_x.y~z").is_ok());
        assert!(validate_path("connect").is_err());
        assert!(validate_path("/{capture}").is_err());
        assert!(validate_path("/:param").is_err());
        assert!(validate_path("/*rest").is_err());
    }

    #[test]
    fn test_validate_upgrade() {
        let request = upgrade_request("/connect").body(()).unwrap();
        let key = validate_upgrade(request.method(), request.headers()).unwrap();
        assert_eq!(key, "dGhlIHNhbXBsZSBub25jZQ==");

        let request = upgrade_request("/connect").method(Method::POST).body(()).unwrap();
        assert!(validate_upgrade(request.method(), request.headers()).is_err());

        let request = Request::builder()
            .uri("/connect")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(SEC_WEBSOCKET_PROTOCOL, "chat, tunnel")
            .body(())
            .unwrap();
        assert!(validate_upgrade(request.method(), request.headers()).is_ok());

        let request = Request::builder()
            .uri("/connect")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap();
        assert_eq!(
            validate_upgrade(request.method(), request.headers()),
            Err("tunnel subprotocol not offered")
        );
    }

    #[tokio::test]
    async fn test_other_paths_are_not_found() {
        let (sessions, _rx) = mpsc::channel(1);
        let app = router("/connect", sessions);

        for uri in ["/", "/connect/", "/other", "/connec"] {
            let response = app
                .clone()
                .oneshot(upgrade_request(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_plain_request_to_tunnel_path_is_rejected() {
        let (sessions, _rx) = mpsc::channel(1);
        let app = router("/connect", sessions);

        let request = Request::builder()
            .uri("/connect")
            .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 1234))))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bridge_carries_bytes() {
        let (a, b) = duplex(0x10000);
        let client_ws = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server_ws = WebSocketStream::from_raw_socket(b, Role::Server, None).await;

        let mut client = bridge(client_ws);
        let mut server = bridge(server_ws);

        client.write_all(b"over the bridge").await.unwrap();
        let mut buf = [0u8; 15];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over the bridge");

        drop(client);
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), server.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_times_out_silent_peer() {
        let (a, b) = duplex(0x10000);
        let ws = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let mut stream = bridge(ws);

        // The peer never answers, so nothing is received until the idle timeout fires.
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        drop(b);
    }
}
