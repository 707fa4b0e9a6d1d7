//! The server lifecycle: accepts tunnel sessions and binds every public connection to a fresh
//! logical stream on the current one.

use std::{net::SocketAddr, sync::Arc};

use arc_swap::ArcSwapOption;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::Semaphore,
};
use tracing::{debug, info, warn};

use super::{bind_stream, close_session};
use crate::{
    config::ServerConfig,
    error::{Result, TunnelError},
    stats::{Direction, TunnelStats},
    transport::{tls::TlsMaterial, TunnelListener, TunnelSession},
};

/// The single-slot holder of the session public connections are bound to. Readers must treat a
/// session that was just replaced or closed as a normal condition.
#[derive(Clone, Default)]
pub struct SessionSlot {
    current: Arc<ArcSwapOption<TunnelSession>>,
}

impl SessionSlot {
    /// The current session, if any and not yet closed.
    pub fn live(&self) -> Option<Arc<TunnelSession>> {
        self.current.load_full().filter(|session| !session.is_closed())
    }

    /// Makes `session` the current one, returning the one it superseded.
    fn replace(&self, session: Arc<TunnelSession>) -> Option<Arc<TunnelSession>> {
        self.current.swap(Some(session))
    }

    /// Empties the slot if it still holds `session`, returning whether it did.
    fn clear_if_current(&self, session: &Arc<TunnelSession>) -> bool {
        let expected = Some(Arc::clone(session));
        let previous = self.current.compare_and_swap(&expected, None::<Arc<TunnelSession>>);
        matches!(&*previous, Some(previous) if Arc::ptr_eq(previous, session))
    }

    /// Closes the current session, if any, and waits a moment for the peer to be told. Returns
    /// whether there was one.
    pub async fn close_current(&self) -> bool {
        close_session(self.current.load_full()).await
    }
}

pub struct TunnelServer {
    public_listener: TcpListener,
    tunnel_listener: TunnelListener,
    slot: SessionSlot,
    stats: Arc<TunnelStats>,
    stream_limit: Option<Arc<Semaphore>>,
    ratelimit: u64,
}

impl TunnelServer {
    /// Binds the tunnel and public listeners. Failing to bind either is fatal.
    pub async fn bind(config: &ServerConfig, material: &TlsMaterial, stats: Arc<TunnelStats>) -> Result<Self> {
        config.validate()?;

        let tunnel_listener = TunnelListener::bind(&config.listen_options(), material).await?;
        let public_listener = TcpListener::bind(config.public).await.map_err(|source| TunnelError::Bind {
            what: "public",
            addr: config.public,
            source,
        })?;

        info!(
            "Listening for {} tunnels on {} and for public connections on {}",
            config.transport,
            tunnel_listener.local_addr(),
            public_listener.local_addr()?
        );

        Ok(Self {
            public_listener,
            tunnel_listener,
            slot: SessionSlot::default(),
            stats,
            stream_limit: config.max_streams.map(|n| Arc::new(Semaphore::new(n))),
            ratelimit: config.ratelimit,
        })
    }

    pub fn public_addr(&self) -> Result<SocketAddr> {
        Ok(self.public_listener.local_addr()?)
    }

    pub fn tunnel_addr(&self) -> SocketAddr {
        self.tunnel_listener.local_addr()
    }

    /// A handle to the current session, valid for as long as the server runs.
    pub fn sessions(&self) -> SessionSlot {
        self.slot.clone()
    }

    /// Runs the accept loops. Only returns if the tunnel listener stops.
    pub async fn run(self) {
        let Self {
            public_listener,
            mut tunnel_listener,
            slot,
            stats,
            stream_limit,
            ratelimit,
        } = self;

        let public_loop = accept_public(&public_listener, &slot, &stats, stream_limit.as_ref(), ratelimit);
        let tunnel_loop = accept_tunnels(&mut tunnel_listener, &slot, &stats);

        select! {
            _ = public_loop => {}
            _ = tunnel_loop => warn!("Tunnel listener stopped"),
        }
    }
}

async fn accept_tunnels(listener: &mut TunnelListener, slot: &SessionSlot, stats: &Arc<TunnelStats>) {
    while let Some(session) = listener.accept().await {
        let session = Arc::new(session);
        if let Some(previous) = slot.replace(Arc::clone(&session)) {
            info!("Session {} supersedes session {}", session.id(), previous.id());
        }

        stats.set_connected(true);
        info!("Tunnel active (session {} from {})", session.id(), session.remote_addr());

        let slot = slot.clone();
        let stats = Arc::clone(stats);
        tokio::spawn(async move {
            session.closed().await;
            if slot.clear_if_current(&session) {
                stats.set_connected(false);
                info!(
                    "Session {} closed after {:?}, waiting for a tunnel",
                    session.id(),
                    session.established_at().elapsed()
                );
            } else {
                debug!("Superseded session {} closed", session.id());
            }
        });
    }
}

async fn accept_public(
    listener: &TcpListener,
    slot: &SessionSlot,
    stats: &Arc<TunnelStats>,
    stream_limit: Option<&Arc<Semaphore>>,
    ratelimit: u64,
) {
    loop {
        let (tcp_stream, from) = match listener.accept().await {
            Ok(t) => t,
            Err(error) => {
                warn!("Error accepting incoming public connection: {error}");
                continue;
            }
        };

        let Some(session) = slot.live() else {
            info!("Closing public connection from {from}: no active tunnel");
            continue;
        };

        let permit = match stream_limit.map(|limit| Arc::clone(limit).try_acquire_owned()) {
            None => None,
            Some(Ok(permit)) => Some(permit),
            Some(Err(_)) => {
                warn!("Closing public connection from {from}: stream limit reached");
                continue;
            }
        };

        let stats = Arc::clone(stats);
        tokio::spawn(async move {
            let _permit = permit;
            bind_public(tcp_stream, from, &session, stats, ratelimit).await;
        });
    }
}

async fn bind_public(tcp_stream: TcpStream, from: SocketAddr, session: &TunnelSession, stats: Arc<TunnelStats>, ratelimit: u64) {
    let stream = match session.open_stream().await {
        Ok(s) => s,
        Err(error) => {
            warn!("Closing public connection from {from}: couldn't open stream: {error}");
            return;
        }
    };

    if let Err(error) = tcp_stream.set_nodelay(true) {
        debug!("Couldn't set nodelay for {from}: {error}");
    }

    debug!("Public connection from {from} bound to stream {}", stream.id());
    bind_stream(session, stream, tcp_stream, Direction::Inbound, stats, ratelimit).await;
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::duplex;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;
    use crate::transport::yamux::YamuxSession;

    fn session() -> Arc<TunnelSession> {
        let (socket, _) = duplex(1024);
        let session = YamuxSession::new(socket.compat(), ::yamux::Mode::Server);
        Arc::new(TunnelSession::websocket(session, SocketAddr::from((Ipv4Addr::LOCALHOST, 0))))
    }

    #[tokio::test]
    async fn test_superseded_session_leaves_slot_alone() {
        let slot = SessionSlot::default();
        let first = session();
        let second = session();

        assert!(slot.replace(Arc::clone(&first)).is_none());
        let superseded = slot.replace(Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&superseded, &first));

        assert!(!slot.clear_if_current(&first));
        assert!(Arc::ptr_eq(&slot.current.load_full().unwrap(), &second));

        assert!(slot.clear_if_current(&second));
        assert!(slot.current.load_full().is_none());
        assert!(!slot.clear_if_current(&second));
    }
}
