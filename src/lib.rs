//! A reverse TCP tunnel. The server exposes a public port, the client dials out from behind NAT
//! over WebSocket-over-TLS or QUIC, and every public connection is forwarded through its own
//! multiplexed stream to a local service next to the client.

pub mod args;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod logging;
pub mod pump;
pub mod session;
pub mod stats;
pub mod throttle;
pub mod transport;

pub use error::{Result, TunnelError};
pub use stats::TunnelStats;
