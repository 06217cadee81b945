//! S5 (§8): connections spread across shards by least-connections, and a
//! killed shard is skipped in favor of the remaining ones.

use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use ws_balancer::LoadBalancer;
use ws_core::{ConnectionAdmission, WsError};
use ws_metrics::{Metrics, SlowClientTracker};
use ws_shard::Shard;

struct AlwaysAdmit;
impl ConnectionAdmission for AlwaysAdmit {
    fn admit_connection(&self, _remote_ip: IpAddr) -> Result<(), WsError> {
        Ok(())
    }
    fn release_connection(&self) {}
}

/// Bind one shard plus its own axum server, cancellable independently so a
/// test can simulate killing just that shard.
async fn spawn_shard() -> (Arc<Shard>, CancellationToken) {
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let per_shard_shutdown = CancellationToken::new();
    let listener = tokio::net::TcpListener::bind(bind_addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap();

    let shard = Arc::new(Shard::new(
        local_addr.port() as usize,
        local_addr,
        Arc::new(AlwaysAdmit),
        64,
        "localhost:9092".into(),
        Metrics::default(),
        Arc::new(SlowClientTracker::new()),
        per_shard_shutdown.clone(),
        2,
    ));

    let router = shard.router();
    let shutdown_for_server = per_shard_shutdown.clone();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_for_server.cancelled_owned())
        .await
        .ok();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    (shard, per_shard_shutdown)
}

async fn spawn_balancer(shards: Vec<Arc<Shard>>) -> SocketAddr {
    let balancer = Arc::new(LoadBalancer::new(
        shards,
        Arc::new(AlwaysAdmit),
        CancellationToken::new(),
    ));
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = tokio::net::TcpListener::bind(bind_addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    let router = balancer.router();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    local_addr
}

async fn connect(addr: SocketAddr) {
    let url = format!("ws://{addr}/ws");
    let (mut stream, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();
    // Leave the handshake open; hold the stream for the test's duration by
    // leaking it into a detached task so it doesn't immediately close.
    tokio::spawn(async move {
        let _ = stream.send(Message::Ping(Vec::new())).await;
        loop {
            if stream.next().await.is_none() {
                break;
            }
        }
    });
}

/// S5, distribution half: three clients connecting one at a time through
/// the balancer land on three different shards (each pick is
/// least-connections with the other two shards still idle).
#[tokio::test]
async fn three_sequential_connections_spread_across_three_shards() {
    let (shard_a, _guard_a) = spawn_shard().await;
    let (shard_b, _guard_b) = spawn_shard().await;
    let (shard_c, _guard_c) = spawn_shard().await;
    let shards = vec![Arc::clone(&shard_a), Arc::clone(&shard_b), Arc::clone(&shard_c)];
    let balancer_addr = spawn_balancer(shards).await;

    for _ in 0..3 {
        connect(balancer_addr).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(shard_a.connection_count(), 1);
    assert_eq!(shard_b.connection_count(), 1);
    assert_eq!(shard_c.connection_count(), 1);
}

/// S5, failover half: once a shard is killed, new connections route only to
/// the remaining live shards instead of failing outright.
#[tokio::test]
async fn killed_shard_is_skipped_by_new_connections() {
    let (shard_a, guard_a) = spawn_shard().await;
    let (shard_b, _guard_b) = spawn_shard().await;
    let shards = vec![Arc::clone(&shard_a), Arc::clone(&shard_b)];
    let balancer_addr = spawn_balancer(shards).await;

    guard_a.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    for _ in 0..2 {
        connect(balancer_addr).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(shard_a.connection_count(), 0, "killed shard must receive no new connections");
    assert_eq!(shard_b.connection_count(), 2, "surviving shard must absorb both connections");
}
