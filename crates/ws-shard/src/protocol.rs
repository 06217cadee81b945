//! Client → server message handling (§4.5, §6).

use crate::client::ClientHandle;
use std::sync::Arc;
use ws_broadcast::OutboundPayload;
use ws_core::{
    ChannelsData, ClientMessage, Priority, ReconnectAckData, ReconnectData, ReconnectErrorData,
    WsError,
};
use ws_subscription_index::SubscriptionIndex;

/// Parse and dispatch one inbound text frame. Returns the protocol
/// violation as an `Err` so the caller (readPump) can classify the
/// disconnect and send `system:error` before closing with 1008 (§6, S6).
pub async fn handle_text_message(
    client: &ClientHandle,
    index: &SubscriptionIndex<ClientHandle>,
    kafka_brokers: &str,
    raw: &str,
) -> Result<(), WsError> {
    let message: ClientMessage = serde_json::from_str(raw)
        .map_err(|err| WsError::ProtocolViolation(format!("malformed client message: {err}")))?;

    match message {
        ClientMessage::Subscribe(ChannelsData { channels }) => {
            for channel in &channels {
                index.add(channel, client.clone());
                client.subscribe(channel);
            }
            send(client, "subscribe_ack", serde_json::json!({ "channels": channels }));
        }
        ClientMessage::Unsubscribe(ChannelsData { channels }) => {
            for channel in &channels {
                index.remove(channel, client.id());
                client.unsubscribe(channel);
            }
            send(client, "unsubscribe_ack", serde_json::json!({ "channels": channels }));
        }
        ClientMessage::Ping(ping) => {
            send(
                client,
                "pong",
                serde_json::json!({ "ts": ping.ts, "server_ts": ws_core::now_millis() }),
            );
        }
        ClientMessage::Reconnect(data) => {
            handle_reconnect(client, kafka_brokers, data).await;
        }
    }

    Ok(())
}

/// Entry point for §4.6 "on receipt of a `reconnect` message from an
/// already-upgraded connection".
async fn handle_reconnect(client: &ClientHandle, kafka_brokers: &str, data: ReconnectData) {
    match ws_kafka::replay(kafka_brokers, &data.last_offset).await {
        Ok(records) => {
            let subscribed: std::collections::HashSet<String> =
                client.subscribed_channels().into_iter().collect();
            let mut replayed = 0usize;

            for record in records {
                // §4.6 step 5: only forward records the client is
                // currently subscribed to.
                if !subscribed.contains(&record.channel()) {
                    continue;
                }
                let Ok(body) = serde_json::from_slice::<serde_json::Value>(&record.record.value)
                else {
                    continue;
                };
                let payload = Arc::new(OutboundPayload {
                    kind: "replay:message",
                    priority: Priority::Normal,
                    body: Arc::new(body),
                });
                if client.try_send(payload) {
                    replayed += 1;
                }
            }

            send(
                client,
                "reconnect_ack",
                serde_json::to_value(ReconnectAckData {
                    status: "completed",
                    messages_replayed: replayed,
                })
                .unwrap_or(serde_json::Value::Null),
            );
        }
        Err(err) => {
            send(
                client,
                "reconnect_error",
                serde_json::to_value(ReconnectErrorData {
                    message: err.to_string(),
                })
                .unwrap_or(serde_json::Value::Null),
            );
        }
    }
}

/// Enqueue a server-generated ack/error frame. These are addressed to one
/// client only, so a plain non-blocking `try_send` is enough — none of
/// them are CRITICAL-priority.
fn send(client: &ClientHandle, kind: &'static str, data: serde_json::Value) {
    let payload = Arc::new(OutboundPayload {
        kind,
        priority: Priority::Normal,
        body: Arc::new(data),
    });
    let _ = client.try_send(payload);
}

/// Build the `system:error` payload for a protocol violation (§6, S6).
#[must_use]
pub fn system_error_payload(err: &WsError) -> Arc<OutboundPayload> {
    Arc::new(OutboundPayload {
        kind: "system:error",
        priority: Priority::Normal,
        body: Arc::new(serde_json::json!({
            "code": "protocol_violation",
            "message": err.to_string(),
        })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:9001".parse().unwrap()
    }

    #[tokio::test]
    async fn subscribe_adds_to_index_and_acks() {
        let index: SubscriptionIndex<ClientHandle> = SubscriptionIndex::new(4);
        let (client, mut rx, _close_rx) = ClientHandle::new(addr(), 8);

        handle_text_message(
            &client,
            &index,
            "localhost:9092",
            r#"{"type":"subscribe","data":{"channels":["BTC.trade"]}}"#,
        )
        .await
        .unwrap();

        assert_eq!(index.get("BTC.trade").len(), 1);
        let payload = rx.try_recv().unwrap();
        assert_eq!(payload.kind, "subscribe_ack");
    }

    #[tokio::test]
    async fn malformed_message_is_a_protocol_violation() {
        let index: SubscriptionIndex<ClientHandle> = SubscriptionIndex::new(4);
        let (client, _rx, _close_rx) = ClientHandle::new(addr(), 8);

        let result = handle_text_message(&client, &index, "localhost:9092", "not json").await;
        assert!(matches!(result, Err(WsError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn unsubscribe_removes_from_index_and_acks() {
        let index: SubscriptionIndex<ClientHandle> = SubscriptionIndex::new(4);
        let (client, mut rx, _close_rx) = ClientHandle::new(addr(), 8);
        index.add("BTC.trade", client.clone());
        client.subscribe("BTC.trade");

        handle_text_message(
            &client,
            &index,
            "localhost:9092",
            r#"{"type":"unsubscribe","data":{"channels":["BTC.trade"]}}"#,
        )
        .await
        .unwrap();

        assert_eq!(index.get("BTC.trade").len(), 0);
        let payload = rx.try_recv().unwrap();
        assert_eq!(payload.kind, "unsubscribe_ack");
    }
}
