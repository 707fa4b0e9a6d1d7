//! The server and client lifecycles keeping one tunnel session alive and binding streams to it.

use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    time::timeout,
};
use tracing::debug;

use crate::{
    pump::forward_pair,
    stats::{Direction, TunnelStats},
    throttle::ThrottledStream,
    transport::{LogicalStream, TunnelSession},
};

pub mod client;
pub mod server;

/// How long closing a session waits for the close to go out.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(2);

async fn close_session(session: Option<Arc<TunnelSession>>) -> bool {
    let Some(session) = session else {
        return false;
    };

    session.close();
    if timeout(CLOSE_GRACE_PERIOD, session.closed()).await.is_err() {
        debug!("Session {} didn't close in time", session.id());
    }

    true
}

/// Forwards bytes between a logical stream of `session` and the raw socket bound to it until both
/// directions are done or the session closes, keeping the pair counted as active meanwhile.
/// `socket_to_stream` is the direction of the bytes read from the socket. The socket is throttled
/// to `rate` bytes per second.
pub(crate) async fn bind_stream<S>(
    session: &TunnelSession,
    stream: LogicalStream,
    socket: S,
    socket_to_stream: Direction,
    stats: Arc<TunnelStats>,
    rate: u64,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _guard = stats.track_stream();
    let stream_id = stream.id();
    debug!("Stream {stream_id} bound");

    // Shaping happens on the socket only, so the pump itself runs unthrottled.
    let forward = forward_pair(ThrottledStream::new(socket, rate), stream, socket_to_stream, Some(&stats), 0);

    // Both ends are dropped with `forward` if the session goes first.
    let outcome = select! {
        outcome = forward => outcome,
        _ = session.closed() => {
            debug!("Stream {stream_id} torn down with session {}", session.id());
            return;
        }
    };

    match (&outcome.a_to_b.error, &outcome.b_to_a.error) {
        (None, None) => debug!(
            "Stream {stream_id} finished after {} bytes up and {} bytes down",
            outcome.a_to_b.bytes, outcome.b_to_a.bytes
        ),
        (Some(error), _) | (None, Some(error)) => debug!("Stream {stream_id} ended: {error}"),
    }
}
