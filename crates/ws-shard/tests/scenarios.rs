//! End-to-end scenario tests driving a real bound `Shard` with WebSocket
//! clients, covering the reconnect-free scenarios from §8: S1 (subscribe
//! then receive a price update), S2 (two independent subscribers), S4
//! (connection admission cap), and S6 (malformed subscribe closes 1008).

use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use ws_core::{ConnectionAdmission, DecodedRecord, KafkaRecordView, WsError};
use ws_metrics::{Metrics, SlowClientTracker};
use ws_shard::Shard;

struct AlwaysAdmit;
impl ConnectionAdmission for AlwaysAdmit {
    fn admit_connection(&self, _remote_ip: IpAddr) -> Result<(), WsError> {
        Ok(())
    }
    fn release_connection(&self) {}
}

/// Admits `max` connections total, then rejects with `ResourceExhausted`
/// (§4.1 S4: `WS_MAX_CONNECTIONS=3` rejects the 4th with a 503).
struct CappedAdmit {
    max: u64,
    admitted: AtomicU64,
}

impl ConnectionAdmission for CappedAdmit {
    fn admit_connection(&self, _remote_ip: IpAddr) -> Result<(), WsError> {
        let current = self.admitted.fetch_add(1, Ordering::SeqCst);
        if current >= self.max {
            self.admitted.fetch_sub(1, Ordering::SeqCst);
            return Err(WsError::ResourceExhausted("max connections reached".into()));
        }
        Ok(())
    }

    fn release_connection(&self) {
        self.admitted.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn spawn_shard(admission: Arc<dyn ConnectionAdmission>) -> (Arc<Shard>, SocketAddr) {
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let shard = Arc::new(Shard::new(
        0,
        bind_addr,
        admission,
        64,
        "localhost:9092".into(),
        Metrics::default(),
        Arc::new(SlowClientTracker::new()),
        CancellationToken::new(),
        2,
    ));

    let router = shard.router();
    let listener = tokio::net::TcpListener::bind(bind_addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    // Give the listener a moment to start accepting.
    tokio::time::sleep(Duration::from_millis(20)).await;

    (shard, local_addr)
}

fn decoded_record(topic: &str, body: &'static str) -> DecodedRecord {
    DecodedRecord::decode(KafkaRecordView {
        topic: topic.to_string(),
        partition: 0,
        offset: 1,
        key: None,
        value: bytes::Bytes::from_static(body.as_bytes()),
        headers: Vec::new(),
        ts: 0,
    })
    .unwrap()
}

async fn connect(addr: SocketAddr) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let url = format!("ws://{addr}/ws");
    let (stream, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();
    stream
}

/// S1: a client subscribes to a channel, then a matching Kafka record is
/// published and the client receives an envelope with that channel's data.
#[tokio::test]
async fn s1_subscribe_then_receive_price_update() {
    let (shard, addr) = spawn_shard(Arc::new(AlwaysAdmit)).await;
    let mut client = connect(addr).await;

    client
        .send(Message::Text(
            r#"{"type":"subscribe","data":{"channels":["BTC.trade"]}}"#.into(),
        ))
        .await
        .unwrap();
    let ack = client.next().await.unwrap().unwrap();
    let ack: serde_json::Value = serde_json::from_str(ack.to_text().unwrap()).unwrap();
    assert_eq!(ack["type"], "subscribe_ack");

    shard
        .broadcast()
        .publish(&decoded_record(
            "odin.token.BTC.trade",
            r#"{"price":"42000"}"#,
        ))
        .await;

    let message = client.next().await.unwrap().unwrap();
    let envelope: serde_json::Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
    assert_eq!(envelope["type"], "price:update");
    assert_eq!(envelope["data"]["price"], "42000");
    // Second frame on the wire: subscribe_ack was seq 1.
    assert_eq!(envelope["seq"], 2);
}

/// S2: two independently-subscribed clients each get their own copy of a
/// broadcast record, and a record for an unsubscribed channel reaches
/// neither.
#[tokio::test]
async fn s2_two_independent_clients_each_receive_their_subscription() {
    let (shard, addr) = spawn_shard(Arc::new(AlwaysAdmit)).await;
    let mut btc_client = connect(addr).await;
    let mut eth_client = connect(addr).await;

    btc_client
        .send(Message::Text(
            r#"{"type":"subscribe","data":{"channels":["BTC.trade"]}}"#.into(),
        ))
        .await
        .unwrap();
    btc_client.next().await.unwrap().unwrap(); // subscribe_ack

    eth_client
        .send(Message::Text(
            r#"{"type":"subscribe","data":{"channels":["ETH.trade"]}}"#.into(),
        ))
        .await
        .unwrap();
    eth_client.next().await.unwrap().unwrap(); // subscribe_ack

    shard
        .broadcast()
        .publish(&decoded_record("odin.token.BTC.trade", r#"{"price":"1"}"#))
        .await;

    let message = btc_client.next().await.unwrap().unwrap();
    let envelope: serde_json::Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
    assert_eq!(envelope["type"], "price:update");

    // The ETH subscriber must not have received the BTC record. Racing a
    // short timeout against `next()` is the standard way to assert a
    // negative on an async stream.
    let nothing_for_eth = tokio::time::timeout(Duration::from_millis(150), eth_client.next()).await;
    assert!(nothing_for_eth.is_err(), "unsubscribed client must not receive the record");
}

/// S4: a shard admitting at most 3 connections accepts the first three and
/// rejects the fourth before the WebSocket upgrade completes.
#[tokio::test]
async fn s4_fourth_connection_is_rejected_when_shard_is_at_capacity() {
    let admission = Arc::new(CappedAdmit {
        max: 3,
        admitted: AtomicU64::new(0),
    });
    let (_shard, addr) = spawn_shard(admission).await;

    let mut accepted = Vec::new();
    for _ in 0..3 {
        accepted.push(connect(addr).await);
    }

    let url = format!("ws://{addr}/ws");
    let err = tokio_tungstenite::connect_async(&url).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 503);
        }
        other => panic!("expected an HTTP 503 handshake rejection, got {other:?}"),
    }
}

/// S6: a malformed client message gets a `system:error` envelope followed
/// by a close frame carrying code 1008.
#[tokio::test]
async fn s6_malformed_message_sends_system_error_then_closes_1008() {
    let (_shard, addr) = spawn_shard(Arc::new(AlwaysAdmit)).await;
    let mut client = connect(addr).await;

    client
        .send(Message::Text("not a valid client message".into()))
        .await
        .unwrap();

    let error_frame = client.next().await.unwrap().unwrap();
    let envelope: serde_json::Value = serde_json::from_str(error_frame.to_text().unwrap()).unwrap();
    assert_eq!(envelope["type"], "system:error");
    assert_eq!(envelope["data"]["code"], "protocol_violation");

    let close_frame = client.next().await.unwrap().unwrap();
    match close_frame {
        Message::Close(Some(frame)) => assert_eq!(frame.code, 1008u16.into()),
        other => panic!("expected a close frame with code 1008, got {other:?}"),
    }
}
