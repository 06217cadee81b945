//! The in-process `LoadBalancer` (multi mode only, §4.7).
//!
//! Fronts the public port, picks a shard by least-connections, dials it
//! over loopback with `tokio-tungstenite`, and copies frames
//! bidirectionally between the public client and the chosen shard.

mod proxy;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ws_core::ConnectionAdmission;
use ws_shard::Shard;

/// The load balancer's public-facing state (§4.7).
pub struct LoadBalancer {
    shards: Vec<Arc<Shard>>,
    admission: Arc<dyn ConnectionAdmission>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("shard_count", &self.shards.len())
            .finish_non_exhaustive()
    }
}

impl LoadBalancer {
    /// Build a balancer fronting `shards`. `admission` is the process-wide
    /// `ResourceGuard`, distinct from each shard's own per-shard admission
    /// (§4.1, §4.7 step 1).
    #[must_use]
    pub fn new(
        shards: Vec<Arc<Shard>>,
        admission: Arc<dyn ConnectionAdmission>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shards,
            admission,
            shutdown,
        }
    }

    /// Build the public axum router. Mount with
    /// `into_make_service_with_connect_info::<SocketAddr>()` for the real
    /// client IP (§4.1).
    #[must_use]
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(self))
    }

    /// Shards ordered least-connections-first, ties broken by lowest id
    /// (§4.7 step 2).
    fn shard_order(&self) -> Vec<Arc<Shard>> {
        let mut ordered: Vec<Arc<Shard>> = self.shards.clone();
        ordered.sort_by_key(|shard| (shard.connection_count(), shard.id));
        ordered
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(lb): State<Arc<LoadBalancer>>,
) -> Response {
    if let Err(err) = lb.admission.admit_connection(remote_addr.ip()) {
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        return (status, err.to_string()).into_response();
    }

    // Dial the backend before upgrading the public client, so total
    // backend exhaustion returns a clean HTTP 503 instead of upgrading
    // and immediately closing (§4.7 step 3).
    let ordered = lb.shard_order();
    let Some((backend, shard_id)) = proxy::dial_any_shard(&ordered).await else {
        lb.admission.release_connection();
        warn!("all shards exhausted their handshake attempts");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "no shard backend available",
        )
            .into_response();
    };

    info!(shard_id, remote_addr = %remote_addr, "routed connection to shard");
    let admission = Arc::clone(&lb.admission);
    let task_admission = Arc::clone(&lb.admission);
    let shutdown = lb.shutdown.clone();

    ws.on_upgrade(move |socket| async move {
        proxy::copy_bidirectional(socket, backend, shutdown, task_admission).await;
        admission.release_connection();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use ws_core::WsError;

    struct AlwaysAdmit;
    impl ConnectionAdmission for AlwaysAdmit {
        fn admit_connection(&self, _remote_ip: IpAddr) -> Result<(), WsError> {
            Ok(())
        }
        fn release_connection(&self) {}
    }

    #[test]
    fn shard_order_sorts_by_connections_then_id() {
        let shard_a = Arc::new(Shard::new(
            2,
            "127.0.0.1:9102".parse().unwrap(),
            Arc::new(AlwaysAdmit),
            512,
            "localhost:9092".into(),
            ws_metrics::Metrics::default(),
            Arc::new(ws_metrics::SlowClientTracker::new()),
            CancellationToken::new(),
            4,
        ));
        let shard_b = Arc::new(Shard::new(
            1,
            "127.0.0.1:9101".parse().unwrap(),
            Arc::new(AlwaysAdmit),
            512,
            "localhost:9092".into(),
            ws_metrics::Metrics::default(),
            Arc::new(ws_metrics::SlowClientTracker::new()),
            CancellationToken::new(),
            4,
        ));

        let lb = LoadBalancer::new(
            vec![Arc::clone(&shard_a), Arc::clone(&shard_b)],
            Arc::new(AlwaysAdmit),
            CancellationToken::new(),
        );

        // Both idle (0 connections each): tie-break on lowest id.
        let ordered = lb.shard_order();
        assert_eq!(ordered[0].id, 1);
        assert_eq!(ordered[1].id, 2);
    }
}
