//! The command-line surface.

use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use url::Url;

use crate::{
    config::{
        ClientConfig, ServerConfig, DEFAULT_CLIENT_DASHBOARD_PORT, DEFAULT_SERVER_DASHBOARD_PORT, DEFAULT_SUCCESS_MARKER,
    },
    error::TunnelError,
    transport::TransportKind,
};

mod addresses;

pub use addresses::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgumentsError {
    #[error("Invalid socket address after {arg}: {value}")]
    InvalidSocketAddress { arg: &'static str, value: String },

    #[error("Invalid server URL {value}: {reason}")]
    InvalidUrl { value: String, reason: String },

    #[error("{0}")]
    Invalid(String),
}

impl From<TunnelError> for ArgumentsError {
    fn from(error: TunnelError) -> Self {
        Self::Invalid(error.to_string())
    }
}

/// Reverse TCP tunnel over WebSocket-over-TLS or QUIC.
#[derive(Debug, Parser)]
#[command(name = "phantom", version, about)]
pub struct StartupArguments {
    /// Log debug information.
    #[arg(short, long, global = true, conflicts_with = "silent")]
    pub verbose: bool,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    pub silent: bool,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub mode: StartupMode,
}

#[derive(Debug, Subcommand)]
pub enum StartupMode {
    /// Expose a public port and wait for a client to tunnel it through.
    Server(ServerArguments),

    /// Dial a server and forward the streams it opens to a local service.
    Client(ClientArguments),
}

#[derive(Debug, Args)]
pub struct ServerArguments {
    /// Where to listen for the tunnel client.
    #[arg(long, default_value = ":443", value_name = "ADDR")]
    pub listen: String,

    /// Where to listen for end users.
    #[arg(long, default_value = ":8000", value_name = "ADDR")]
    pub public: String,

    /// The tunnel transport, `ws` or `quic`.
    #[arg(long, default_value = "ws")]
    pub transport: TransportKind,

    /// The secret HTTP path upgraded to a WebSocket.
    #[arg(long, default_value = "/connect")]
    pub path: String,

    /// The shared secret QUIC clients must present as their ALPN protocol.
    #[arg(long)]
    pub secret: Option<String>,

    /// PEM certificate chain, generated together with --key if neither exists.
    #[arg(long, default_value = "server.crt", value_name = "PATH")]
    pub cert: PathBuf,

    /// PEM private key.
    #[arg(long, default_value = "server.key", value_name = "PATH")]
    pub key: PathBuf,

    /// Maximum bytes per second per connection, 0 for unlimited.
    #[arg(long, default_value_t = 0, value_name = "BYTES")]
    pub ratelimit: u64,

    /// Port of the stats endpoint, 0 to disable it.
    #[arg(long, default_value_t = DEFAULT_SERVER_DASHBOARD_PORT, value_name = "PORT")]
    pub dashboard: u16,

    /// Maximum concurrent connections, 0 for unlimited.
    #[arg(long, default_value_t = 0, value_name = "N")]
    pub max_streams: usize,
}

impl ServerArguments {
    pub fn into_config(self) -> Result<ServerConfig, ArgumentsError> {
        let config = ServerConfig {
            listen: parse_listen_address("--listen", &self.listen)?,
            public: parse_listen_address("--public", &self.public)?,
            transport: self.transport,
            path: self.path,
            secret: self.secret,
            cert: self.cert,
            key: self.key,
            ratelimit: self.ratelimit,
            dashboard: port_or_disabled(self.dashboard),
            max_streams: (self.max_streams != 0).then_some(self.max_streams),
        };

        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Args)]
pub struct ClientArguments {
    /// The tunnel server, `wss://host:port/path` or `quic://host:port`.
    #[arg(long, value_name = "URL")]
    pub server: String,

    /// The local service to expose.
    #[arg(long, value_name = "ADDR")]
    pub local: String,

    /// The shared secret presented as the QUIC ALPN protocol.
    #[arg(long)]
    pub secret: Option<String>,

    /// Maximum bytes per second per connection, 0 for unlimited.
    #[arg(long, default_value_t = 0, value_name = "BYTES")]
    pub ratelimit: u64,

    /// Port of the stats endpoint, 0 to disable it.
    #[arg(long, default_value_t = DEFAULT_CLIENT_DASHBOARD_PORT, value_name = "PORT")]
    pub dashboard: u16,

    /// File created after every successful connection.
    #[arg(long, default_value = DEFAULT_SUCCESS_MARKER, value_name = "PATH")]
    pub success_marker: PathBuf,

    /// Seconds to wait before dialing again after a failure.
    #[arg(long, default_value_t = 5, value_name = "SECS")]
    pub retry_interval: u64,

    /// Seconds a dial may take.
    #[arg(long, default_value_t = 60, value_name = "SECS")]
    pub dial_timeout: u64,
}

impl ClientArguments {
    pub fn into_config(self) -> Result<ClientConfig, ArgumentsError> {
        let server = Url::parse(&self.server).map_err(|error| ArgumentsError::InvalidUrl {
            value: self.server.clone(),
            reason: error.to_string(),
        })?;

        if self.dial_timeout == 0 {
            return Err(ArgumentsError::Invalid("--dial-timeout must be at least 1 second".to_string()));
        }

        let config = ClientConfig {
            server,
            local: parse_local_address("--local", &self.local)?,
            secret: self.secret,
            ratelimit: self.ratelimit,
            dashboard: port_or_disabled(self.dashboard),
            success_marker: Some(self.success_marker),
            retry_interval: Duration::from_secs(self.retry_interval),
            dial_timeout: Duration::from_secs(self.dial_timeout),
        };

        config.validate()?;
        Ok(config)
    }
}

fn port_or_disabled(port: u16) -> Option<u16> {
    (port != 0).then_some(port)
}

pub fn parse_arguments<I, T>(args: I) -> Result<StartupArguments, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    StartupArguments::try_parse_from(args)
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;

    fn parse(args: &[&str]) -> StartupArguments {
        parse_arguments(std::iter::once("phantom").chain(args.iter().copied())).unwrap()
    }

    fn server(args: &[&str]) -> Result<ServerConfig, ArgumentsError> {
        match parse(&[&["server"][..], args].concat()).mode {
            StartupMode::Server(server) => server.into_config(),
            StartupMode::Client(_) => panic!("Expected server mode"),
        }
    }

    fn client(args: &[&str]) -> Result<ClientConfig, ArgumentsError> {
        match parse(&[&["client"][..], args].concat()).mode {
            StartupMode::Client(client) => client.into_config(),
            StartupMode::Server(_) => panic!("Expected client mode"),
        }
    }

    #[test]
    fn test_server_defaults() {
        let config = server(&[]).unwrap();
        assert_eq!(config.listen, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 443)));
        assert_eq!(config.public, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8000)));
        assert_eq!(config.transport, TransportKind::WebSocket);
        assert_eq!(config.path, "/connect");
        assert_eq!(config.cert, PathBuf::from("server.crt"));
        assert_eq!(config.key, PathBuf::from("server.key"));
        assert_eq!(config.ratelimit, 0);
        assert_eq!(config.dashboard, Some(8080));
        assert_eq!(config.max_streams, None);
    }

    #[test]
    fn test_server_options() {
        let config = server(&[
            "--listen",
            "127.0.0.1:4433",
            "--public",
            "9000",
            "--transport",
            "quic",
            "--secret",
            "s3cret",
            "--ratelimit",
            "1024",
            "--dashboard",
            "0",
            "--max-streams",
            "64",
        ])
        .unwrap();

        assert_eq!(config.listen, SocketAddr::from((Ipv4Addr::LOCALHOST, 4433)));
        assert_eq!(config.public, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9000)));
        assert_eq!(config.transport, TransportKind::Quic);
        assert_eq!(config.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.ratelimit, 1024);
        assert_eq!(config.dashboard, None);
        assert_eq!(config.max_streams, Some(64));
    }

    #[test]
    fn test_server_invalid() {
        assert!(matches!(server(&["--path", "connect"]), Err(ArgumentsError::Invalid(_))));
        assert!(matches!(server(&["--transport", "quic"]), Err(ArgumentsError::Invalid(_))));
        assert!(matches!(
            server(&["--public", "nowhere"]),
            Err(ArgumentsError::InvalidSocketAddress { arg: "--public", .. })
        ));
        assert!(parse_arguments(["phantom", "server", "--transport", "tcp"]).is_err());
    }

    #[test]
    fn test_client_defaults() {
        let config = client(&["--server", "wss://example.com:443/connect", "--local", "22"]).unwrap();
        assert_eq!(config.server.as_str(), "wss://example.com/connect");
        assert_eq!(config.local, "127.0.0.1:22");
        assert_eq!(config.dashboard, Some(8081));
        assert_eq!(config.success_marker, Some(PathBuf::from(DEFAULT_SUCCESS_MARKER)));
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.dial_timeout, Duration::from_secs(60));
        assert_eq!(config.connector().unwrap().kind(), TransportKind::WebSocket);
    }

    #[test]
    fn test_client_invalid() {
        assert!(matches!(
            client(&["--server", "not a url", "--local", "22"]),
            Err(ArgumentsError::InvalidUrl { .. })
        ));
        assert!(matches!(
            client(&["--server", "http://example.com/connect", "--local", "22"]),
            Err(ArgumentsError::Invalid(_))
        ));
        assert!(matches!(
            client(&["--server", "quic://example.com:4433", "--local", "22"]),
            Err(ArgumentsError::Invalid(_))
        ));
        assert!(client(&["--server", "quic://example.com:4433", "--local", "22", "--secret", "s"]).is_ok());
        assert!(parse_arguments(["phantom", "client", "--local", "22"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let args = parse(&["-v", "server", "--log-file", "/tmp/phantom.log"]);
        assert!(args.verbose);
        assert!(!args.silent);
        assert_eq!(args.log_file, Some(PathBuf::from("/tmp/phantom.log")));

        assert!(parse_arguments(["phantom", "-v", "-s", "server"]).is_err());
    }
}
