//! The stats query endpoint polled by the dashboard.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{error, info};

use crate::{
    error::{Result, TunnelError},
    stats::{StatsSnapshot, TunnelStats},
};

pub fn router(stats: Arc<TunnelStats>) -> Router {
    Router::new()
        .route("/stats", get(get_stats))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(stats)
}

async fn get_stats(State(stats): State<Arc<TunnelStats>>) -> Json<StatsSnapshot> {
    Json(stats.snapshot())
}

/// Binds the endpoint on all interfaces at `port` and serves it in a background task.
pub async fn spawn(port: u16, stats: Arc<TunnelStats>) -> Result<(SocketAddr, JoinHandle<()>)> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr).await.map_err(|source| TunnelError::Bind {
        what: "dashboard",
        addr,
        source,
    })?;
    let local_addr = listener.local_addr()?;
    info!("Serving stats at http://{local_addr}/stats");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(stats)).await {
            error!("Stats endpoint stopped: {e}");
        }
    });

    Ok((local_addr, handle))
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;
    use crate::stats::Direction;

    #[tokio::test]
    async fn test_stats_endpoint() {
        let stats = Arc::new(TunnelStats::new());
        stats.record_bytes(Direction::Inbound, 42);
        stats.record_bytes(Direction::Outbound, 7);
        stats.set_connected(true);
        let _guard = stats.track_stream();

        let response = router(Arc::clone(&stats))
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["active_connections"], 1);
        assert_eq!(json["total_bytes_in"], 42);
        assert_eq!(json["total_bytes_out"], 7);
        assert_eq!(json["connected"], true);
        assert!(json["uptime"].is_string());
        assert!(json["uptime_secs"].is_u64());
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let response = router(Arc::new(TunnelStats::new()))
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
