//! The client lifecycle: dials the server, retrying forever, and binds every stream the server
//! opens to a fresh connection to the local service.

use std::{path::PathBuf, sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use super::{bind_stream, close_session};
use crate::{
    config::ClientConfig,
    error::{Result, TunnelError},
    stats::{Direction, TunnelStats},
    transport::{LogicalStream, TunnelConnector, TunnelSession},
};

pub struct TunnelClient {
    connector: TunnelConnector,
    local: Arc<str>,
    stats: Arc<TunnelStats>,
    ratelimit: u64,
    success_marker: Option<PathBuf>,
    retry_interval: Duration,
    dial_timeout: Duration,
    current: Arc<ArcSwapOption<TunnelSession>>,
}

/// Closes the client's current session from outside its lifecycle.
#[derive(Clone)]
pub struct ClientHandle {
    current: Arc<ArcSwapOption<TunnelSession>>,
}

impl ClientHandle {
    pub async fn close_current(&self) -> bool {
        close_session(self.current.load_full()).await
    }
}

impl TunnelClient {
    pub fn new(config: &ClientConfig, stats: Arc<TunnelStats>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            connector: config.connector()?,
            local: Arc::from(config.local.as_str()),
            stats,
            ratelimit: config.ratelimit,
            success_marker: config.success_marker.clone(),
            retry_interval: config.retry_interval,
            dial_timeout: config.dial_timeout,
            current: Arc::new(ArcSwapOption::empty()),
        })
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            current: Arc::clone(&self.current),
        }
    }

    /// Keeps a session to the server alive, forever.
    pub async fn run(&self) {
        loop {
            self.stats.set_connected(false);
            let session = match self.dial().await {
                Ok(session) => Arc::new(session),
                Err(error) => {
                    warn!("Connection failed: {error}, retrying in {:?}", self.retry_interval);
                    sleep(self.retry_interval).await;
                    continue;
                }
            };

            self.current.store(Some(Arc::clone(&session)));
            self.stats.set_connected(true);
            info!(
                "Tunnel established with {} over {} (session {})",
                session.remote_addr(),
                session.kind(),
                session.id()
            );
            self.signal_success().await;

            let error = self.serve(&session).await;
            self.current.store(None);
            session.close();
            self.stats.set_connected(false);
            warn!(
                "Tunnel session {} lost after {:?}: {error}, reconnecting",
                session.id(),
                session.established_at().elapsed()
            );
        }
    }

    async fn dial(&self) -> Result<TunnelSession> {
        info!("Connecting to {} over {}", self.connector.url(), self.connector.kind());
        match timeout(self.dial_timeout, self.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::DialTimeout(self.dial_timeout)),
        }
    }

    /// Accepts streams until the session fails, returning the failure.
    async fn serve(&self, session: &Arc<TunnelSession>) -> TunnelError {
        loop {
            let mut stream = match session.accept_stream().await {
                Ok(stream) => stream,
                Err(error) => return error,
            };

            let session = Arc::clone(session);
            let local = Arc::clone(&self.local);
            let stats = Arc::clone(&self.stats);
            let ratelimit = self.ratelimit;
            tokio::spawn(async move {
                if let Err(error) = stream.expect_preamble().await {
                    warn!("Dropping stream {}: {error}", stream.id());
                    return;
                }

                bind_local(&session, stream, &local, stats, ratelimit).await;
            });
        }
    }

    async fn signal_success(&self) {
        let Some(path) = &self.success_marker else {
            return;
        };

        match tokio::fs::File::create(path).await {
            Ok(_) => debug!("Wrote success marker {}", path.display()),
            Err(error) => warn!("Couldn't write success marker {}: {error}", path.display()),
        }
    }
}

async fn bind_local(session: &TunnelSession, stream: LogicalStream, local: &str, stats: Arc<TunnelStats>, ratelimit: u64) {
    let local_stream = match TcpStream::connect(local).await {
        Ok(s) => s,
        Err(error) => {
            warn!("Couldn't connect to local service at {local}, dropping stream {}: {error}", stream.id());
            return;
        }
    };

    if let Err(error) = local_stream.set_nodelay(true) {
        debug!("Couldn't set nodelay for local connection: {error}");
    }

    debug!("Stream {} bound to local service at {local}", stream.id());
    bind_stream(session, stream, local_stream, Direction::Outbound, stats, ratelimit).await;
}
