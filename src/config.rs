//! Resolved runtime parameters for the server and client lifecycles.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use url::Url;

use crate::{
    error::{Result, TunnelError},
    transport::{websocket, ListenOptions, TransportKind, TunnelConnector},
};

pub const DEFAULT_SERVER_DASHBOARD_PORT: u16 = 8080;
pub const DEFAULT_CLIENT_DASHBOARD_PORT: u16 = 8081;
pub const DEFAULT_SUCCESS_MARKER: &str = "/tmp/phantom_success.signal";
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where the tunnel transport listens for the client.
    pub listen: SocketAddr,

    /// Where end users connect.
    pub public: SocketAddr,

    pub transport: TransportKind,
    pub path: String,
    pub secret: Option<String>,
    pub cert: PathBuf,
    pub key: PathBuf,

    /// Bytes per second per connection, 0 for unlimited.
    pub ratelimit: u64,

    /// The stats endpoint port, `None` to disable it.
    pub dashboard: Option<u16>,

    /// The most stream pairs bound at once, `None` for no limit.
    pub max_streams: Option<usize>,
}

impl ServerConfig {
    /// Checks the parameters that can't be enforced by their types.
    pub fn validate(&self) -> Result<()> {
        match self.transport {
            TransportKind::WebSocket => websocket::validate_path(&self.path),
            TransportKind::Quic => match self.secret.as_deref() {
                Some(secret) if !secret.is_empty() => Ok(()),
                _ => Err(TunnelError::Config("The QUIC transport requires --secret".to_string())),
            },
        }
    }

    pub fn listen_options(&self) -> ListenOptions {
        ListenOptions {
            addr: self.listen,
            kind: self.transport,
            path: self.path.clone(),
            secret: self.secret.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The tunnel server, `wss://host:port/path` or `quic://host:port`.
    pub server: Url,

    /// The real service, as `host:port`.
    pub local: String,

    pub secret: Option<String>,
    pub ratelimit: u64,
    pub dashboard: Option<u16>,

    /// The file created after every successful connection, `None` to skip it.
    pub success_marker: Option<PathBuf>,

    pub retry_interval: Duration,
    pub dial_timeout: Duration,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server.host_str().map_or(true, str::is_empty) {
            return Err(TunnelError::Config(format!("Server URL {} has no host", self.server)));
        }

        self.connector().map(|_| ())
    }

    pub fn connector(&self) -> Result<TunnelConnector> {
        TunnelConnector::new(self.server.clone(), self.secret.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn server_config() -> ServerConfig {
        ServerConfig {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 443)),
            public: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8000)),
            transport: TransportKind::WebSocket,
            path: "/connect".into(),
            secret: None,
            cert: "server.crt".into(),
            key: "server.key".into(),
            ratelimit: 0,
            dashboard: Some(DEFAULT_SERVER_DASHBOARD_PORT),
            max_streams: None,
        }
    }

    fn client_config(server: &str) -> ClientConfig {
        ClientConfig {
            server: Url::parse(server).unwrap(),
            local: "127.0.0.1:22".into(),
            secret: None,
            ratelimit: 0,
            dashboard: None,
            success_marker: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    #[test]
    fn test_server_validation() {
        assert!(server_config().validate().is_ok());

        let config = ServerConfig {
            path: "connect".into(),
            ..server_config()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            transport: TransportKind::Quic,
            ..server_config()
        };
        assert!(matches!(config.validate(), Err(TunnelError::Config(_))));

        let config = ServerConfig {
            transport: TransportKind::Quic,
            secret: Some("s3cret".into()),
            ..server_config()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_validation() {
        assert!(client_config("wss://example.com:443/connect").validate().is_ok());
        assert!(client_config("https://example.com/connect").validate().is_err());
        assert!(client_config("quic://example.com:4433").validate().is_err());

        let config = ClientConfig {
            secret: Some("s3cret".into()),
            ..client_config("quic://example.com:4433")
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.connector().unwrap().kind(), TransportKind::Quic);
    }
}
