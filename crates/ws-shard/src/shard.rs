//! `Shard`/`Server`: accepts upgrades, owns the per-shard
//! `SubscriptionIndex` and `BroadcastBus`, and hosts the connection
//! lifecycle (§4.5).

use crate::client::ClientHandle;
use crate::pumps;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;
use ws_broadcast::BroadcastBus;
use ws_core::ConnectionAdmission;
use ws_subscription_index::SubscriptionIndex;

/// Everything a connection's pumps need, cloned per connection.
#[derive(Clone)]
pub struct ConnectionContext {
    pub index: Arc<SubscriptionIndex<ClientHandle>>,
    pub kafka_brokers: String,
    pub admission: Arc<dyn ConnectionAdmission>,
    pub metrics: ws_metrics::Metrics,
    pub slow_client_tracker: Arc<ws_metrics::SlowClientTracker>,
    pub shutdown: CancellationToken,
}

/// One fan-out shard (§2, §4.5). In `single` mode this is the whole
/// server; in `multi` mode the `LoadBalancer` fronts one `Shard` per
/// worker.
pub struct Shard {
    pub id: usize,
    pub bind_addr: SocketAddr,
    index: Arc<SubscriptionIndex<ClientHandle>>,
    broadcast: Arc<BroadcastBus<ClientHandle>>,
    admission: Arc<dyn ConnectionAdmission>,
    connection_count: AtomicU64,
    queue_capacity: usize,
    kafka_brokers: String,
    metrics: ws_metrics::Metrics,
    slow_client_tracker: Arc<ws_metrics::SlowClientTracker>,
    shutdown: CancellationToken,
    /// Live clients, keyed by id, so the buffer sampler can read each
    /// connection's outbound queue depth without threading a callback
    /// through every pump (§5 "buffer sampler").
    clients: RwLock<HashMap<u64, ClientHandle>>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("bind_addr", &self.bind_addr)
            .field("connection_count", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl Shard {
    /// Build a shard with its own `SubscriptionIndex`/`BroadcastBus` pair
    /// (§4.2 stripe count defaults to `num_cpus::get()`).
    #[must_use]
    pub fn new(
        id: usize,
        bind_addr: SocketAddr,
        admission: Arc<dyn ConnectionAdmission>,
        queue_capacity: usize,
        kafka_brokers: String,
        metrics: ws_metrics::Metrics,
        slow_client_tracker: Arc<ws_metrics::SlowClientTracker>,
        shutdown: CancellationToken,
        stripe_count: usize,
    ) -> Self {
        let index = Arc::new(SubscriptionIndex::new(stripe_count));
        let broadcast = Arc::new(BroadcastBus::new(Arc::clone(&index)));
        Self {
            id,
            bind_addr,
            index,
            broadcast,
            admission,
            connection_count: AtomicU64::new(0),
            queue_capacity,
            kafka_brokers,
            metrics,
            slow_client_tracker,
            shutdown,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Current connection count, read by the `LoadBalancer` for
    /// least-connections shard selection (§4.7).
    #[must_use]
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// This shard's `BroadcastBus`, published to from `ws-kafka`'s
    /// consumer engine sink (§4.3 step 4, §4.4).
    #[must_use]
    pub fn broadcast(&self) -> Arc<BroadcastBus<ClientHandle>> {
        Arc::clone(&self.broadcast)
    }

    /// Build the axum router exposing `/ws`. Mount with
    /// `into_make_service_with_connect_info::<SocketAddr>()` so
    /// `ConnectInfo` is populated for per-IP admission (§4.1).
    #[must_use]
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(self))
    }

    fn register_client(&self, client: &ClientHandle) {
        self.clients
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(client.id(), client.clone());
    }

    fn deregister_client(&self, id: u64) {
        self.clients
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id);
    }

    /// Sample every connected client's outbound queue depth into the
    /// shared `ws_worker_queue_depth` histogram and set
    /// `ws_worker_queue_utilization_percent` to the average across
    /// clients (§5's periodic "buffer sampler" timer, §6's family list).
    pub fn sample_queue_depths(&self) {
        let clients = self
            .clients
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if clients.is_empty() {
            self.metrics.worker_queue_utilization_percent.set(0.0);
            return;
        }

        let mut utilization_sum = 0.0;
        for client in clients.values() {
            let depth = client.queue_depth();
            self.metrics.worker_queue_depth.record(depth as f64);
            utilization_sum += 100.0 * depth as f64 / client.queue_capacity().max(1) as f64;
        }
        self.metrics
            .worker_queue_utilization_percent
            .set(utilization_sum / clients.len() as f64);
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(shard): State<Arc<Shard>>,
) -> Response {
    if let Err(err) = shard.admission.admit_connection(remote_addr.ip()) {
        let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        return (status, err.to_string()).into_response();
    }

    shard.connection_count.fetch_add(1, Ordering::Relaxed);
    shard.metrics.connections_active.increment(1.0);
    shard.metrics.connections_total.increment(1);
    info!(shard_id = shard.id, remote_addr = %remote_addr, "connection admitted");

    let ctx = Arc::new(ConnectionContext {
        index: Arc::clone(&shard.index),
        kafka_brokers: shard.kafka_brokers.clone(),
        admission: Arc::clone(&shard.admission),
        metrics: shard.metrics.clone(),
        slow_client_tracker: Arc::clone(&shard.slow_client_tracker),
        shutdown: shard.shutdown.clone(),
    });
    let queue_capacity = shard.queue_capacity;
    let shard_for_decrement = Arc::clone(&shard);

    ws.on_upgrade(move |socket| async move {
        let (client, outbound_rx, close_rx) = ClientHandle::new(remote_addr, queue_capacity);
        shard_for_decrement.register_client(&client);
        let client_id = client.id();
        pumps::handle_connection(socket, client, outbound_rx, close_rx, ctx).await;
        shard_for_decrement.deregister_client(client_id);
        shard_for_decrement
            .connection_count
            .fetch_sub(1, Ordering::Relaxed);
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
    fn new_shard_starts_with_zero_connections() {
        let shard = Shard::new(
            0,
            "127.0.0.1:9100".parse().unwrap(),
            Arc::new(AlwaysAdmit),
            512,
            "localhost:9092".into(),
            ws_metrics::Metrics::default(),
            Arc::new(ws_metrics::SlowClientTracker::new()),
            CancellationToken::new(),
            4,
        );
        assert_eq!(shard.connection_count(), 0);
    }
}
