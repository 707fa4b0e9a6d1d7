//! The native QUIC transport. The negotiated ALPN protocol doubles as a shared secret.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use quinn::{
    crypto::rustls::HandshakeData, ClientConfig, Connecting, Connection, Endpoint, IdleTimeout, RecvStream, SendStream,
    ServerConfig, TransportConfig, VarInt,
};
use tokio::{net::lookup_host, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    tls::{self, TlsMaterial},
    yamux::MAX_STREAMS,
    TunnelSession,
};
use crate::error::{Result, TunnelError};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub const MAX_IDLE_TIMEOUT_MILLIS: u32 = 30_000;

/// The QUIC port assumed when a `quic://` URL doesn't name one.
pub const DEFAULT_PORT: u16 = 443;

fn transport_config() -> Arc<TransportConfig> {
    let mut transport_config = TransportConfig::default();
    transport_config.max_concurrent_uni_streams(0_u8.into());
    transport_config.max_concurrent_bidi_streams(VarInt::from_u32(MAX_STREAMS as u32));
    transport_config.keep_alive_interval(Some(KEEPALIVE_INTERVAL));
    transport_config.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(MAX_IDLE_TIMEOUT_MILLIS))));
    Arc::new(transport_config)
}

pub fn configure_server(material: &TlsMaterial, secret: &str) -> Result<ServerConfig> {
    let crypto = tls::quic_server_config(material, secret.as_bytes())?;
    let mut server_config = ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(transport_config());
    Ok(server_config)
}

pub fn configure_client(secret: &str) -> Result<ClientConfig> {
    let crypto = tls::quic_client_config(secret.as_bytes())?;
    let mut client_config = ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(transport_config());
    Ok(client_config)
}

/// Checks that the handshake of `connection` negotiated `secret` as its application protocol.
fn verify_alpn(connection: &Connection, secret: &str) -> Result<()> {
    let protocol = connection
        .handshake_data()
        .and_then(|data| data.downcast::<HandshakeData>().ok())
        .and_then(|data| data.protocol);

    match protocol {
        Some(protocol) if protocol == secret.as_bytes() => Ok(()),
        _ => Err(TunnelError::Handshake("Peer did not negotiate the shared secret".to_string())),
    }
}

/// One established QUIC connection.
pub struct QuicSession {
    connection: Connection,

    // A client owns its endpoint; the server's is shared by every session and owned by the
    // accept task.
    _endpoint: Option<Endpoint>,
}

impl QuicSession {
    pub async fn open_stream(&self) -> Result<(SendStream, RecvStream)> {
        Ok(self.connection.open_bi().await?)
    }

    pub async fn accept_stream(&self) -> Result<(SendStream, RecvStream)> {
        Ok(self.connection.accept_bi().await?)
    }

    pub fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    pub async fn closed(&self) {
        self.connection.closed().await;
    }

    pub fn close(&self) {
        self.connection.close(VarInt::from_u32(0), b"closed");
    }
}

/// Binds a QUIC endpoint and spawns the task accepting connections on it. Established sessions
/// are sent through `sessions`.
pub fn listen(
    addr: SocketAddr,
    material: &TlsMaterial,
    secret: &str,
    sessions: mpsc::Sender<TunnelSession>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let server_config = configure_server(material, secret)?;
    let endpoint = Endpoint::server(server_config, addr).map_err(|source| TunnelError::Bind {
        what: "tunnel",
        addr,
        source,
    })?;
    let local_addr = endpoint.local_addr()?;
    let secret = secret.to_string();

    let handle = tokio::spawn(async move {
        while let Some(connecting) = endpoint.accept().await {
            let secret = secret.clone();
            let sessions = sessions.clone();
            tokio::spawn(async move {
                handle_incoming(connecting, &secret, sessions).await;
            });
        }

        debug!("QUIC endpoint stopped accepting connections");
    });

    Ok((local_addr, handle))
}

async fn handle_incoming(connecting: Connecting, secret: &str, sessions: mpsc::Sender<TunnelSession>) {
    let remote_addr = connecting.remote_address();
    let connection = match connecting.await {
        Ok(c) => c,
        Err(error) => {
            debug!("QUIC handshake with {remote_addr} failed: {error}");
            return;
        }
    };

    if let Err(error) = verify_alpn(&connection, secret) {
        warn!("Rejecting QUIC connection from {remote_addr}: {error}");
        connection.close(VarInt::from_u32(1), b"bad protocol");
        return;
    }

    let session = TunnelSession::quic(QuicSession { connection, _endpoint: None }, remote_addr);
    info!("QUIC tunnel established with {remote_addr} (session {})", session.id());
    if sessions.send(session).await.is_err() {
        debug!("Tunnel listener is gone, dropping session from {remote_addr}");
    }
}

/// Dials a tunnel server at `url` (`quic://host:port`), presenting `secret` as the only ALPN
/// protocol.
pub async fn connect(url: &Url, secret: &str) -> Result<TunnelSession> {
    let host = url
        .host_str()
        .ok_or_else(|| TunnelError::InvalidAddress(format!("{url} has no host")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = url.port().unwrap_or(DEFAULT_PORT);

    let remote_addr = lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| TunnelError::InvalidAddress(format!("{host} did not resolve to any address")))?;

    let bind_addr = match remote_addr {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };

    let mut endpoint = Endpoint::client(bind_addr)?;
    endpoint.set_default_client_config(configure_client(secret)?);

    let connection = endpoint.connect(remote_addr, host)?.await?;
    if let Err(error) = verify_alpn(&connection, secret) {
        connection.close(VarInt::from_u32(1), b"bad protocol");
        return Err(error);
    }

    let session = QuicSession {
        connection,
        _endpoint: Some(endpoint),
    };
    Ok(TunnelSession::quic(session, remote_addr))
}
