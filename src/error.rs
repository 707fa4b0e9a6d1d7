//! Error types for the tunnel engine.

use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors that can occur while establishing or running a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The certificate or private key could not be loaded or generated
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// WebSocket handshake or framing error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A QUIC connection could not be started
    #[error("QUIC connect error: {0}")]
    QuicConnect(#[from] quinn::ConnectError),

    /// A QUIC connection failed or was closed
    #[error("QUIC connection error: {0}")]
    QuicConnection(#[from] quinn::ConnectionError),

    /// The multiplexing layer failed
    #[error("Multiplexing error: {0}")]
    Multiplex(String),

    /// The peer did not complete the tunnel handshake as expected
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// The configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// An address could not be parsed or resolved
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Dialing the tunnel server took too long
    #[error("Dial timed out after {0:?}")]
    DialTimeout(Duration),

    /// The session was closed while an operation was in progress
    #[error("Session is closed")]
    SessionClosed,

    /// A listening socket could not be bound
    #[error("Couldn't bind {what} listener at {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl TunnelError {
    /// Whether this error prevents the process from ever hosting a tunnel, as opposed to errors
    /// the lifecycle recovers from by retrying or dropping a single stream.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self, Self::Bind { .. } | Self::Certificate(_) | Self::Config(_))
    }
}

impl From<yamux::ConnectionError> for TunnelError {
    fn from(error: yamux::ConnectionError) -> Self {
        match error {
            yamux::ConnectionError::Closed => Self::SessionClosed,
            yamux::ConnectionError::Io(error) => Self::Io(error),
            error => Self::Multiplex(error.to_string()),
        }
    }
}

impl From<TunnelError> for io::Error {
    fn from(error: TunnelError) -> Self {
        match error {
            TunnelError::Io(error) => error,
            TunnelError::SessionClosed => io::Error::new(io::ErrorKind::NotConnected, error),
            TunnelError::DialTimeout(_) => io::Error::new(io::ErrorKind::TimedOut, error),
            error => io::Error::new(io::ErrorKind::Other, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;

    #[test]
    fn test_bind_and_certificate_errors_are_fatal() {
        let error = TunnelError::Bind {
            what: "public",
            addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8000)),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(error.is_startup_fatal());
        assert!(TunnelError::Certificate("bad key".into()).is_startup_fatal());
    }

    #[test]
    fn test_transport_errors_are_recoverable() {
        assert!(!TunnelError::SessionClosed.is_startup_fatal());
        assert!(!TunnelError::DialTimeout(Duration::from_secs(60)).is_startup_fatal());
        assert!(!TunnelError::Handshake("wrong protocol".into()).is_startup_fatal());
    }

    #[test]
    fn test_into_io_error_keeps_kind() {
        let error: io::Error = TunnelError::SessionClosed.into();
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);

        let error: io::Error = TunnelError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).into();
        assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);

        let error: io::Error = yamux_closed().into();
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);
    }

    fn yamux_closed() -> TunnelError {
        yamux::ConnectionError::Closed.into()
    }
}
