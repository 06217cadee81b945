//! The per-connection readPump/writePump pair (§4.5).

use crate::client::{ClientHandle, CloseReceiver, OutboundReceiver};
use crate::protocol;
use crate::shard::ConnectionContext;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use ws_core::{now_millis, DisconnectReason, MessageEnvelope, WsError};

/// Transport-level keepalive ping cadence (§4.5).
const PING_INTERVAL: Duration = Duration::from_secs(27);
/// No frame (data or pong) received within this window terminates the
/// connection as a read timeout (§4.5 "read deadline").
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// A single write must complete within this window or the pump treats it
/// as a write failure (§4.5 "writeWait deadline").
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept an upgraded socket and drive it until either pump exits, then
/// run the shared teardown exactly once (§4.5's `closeOnce`-guarded
/// `disconnectClient`). Counted as one scheduler-visible task against
/// `max_goroutines` for the lifetime of both pumps (§4.1, §5).
pub async fn handle_connection(
    socket: WebSocket,
    client: ClientHandle,
    outbound_rx: OutboundReceiver,
    close_rx: CloseReceiver,
    ctx: Arc<ConnectionContext>,
) {
    ctx.admission.task_spawned();

    let (sink, stream) = socket.split();

    let write_client = client.clone();
    let write_ctx = Arc::clone(&ctx);
    let write_task = tokio::spawn(write_pump(sink, outbound_rx, write_client, write_ctx, close_rx));

    let read_client = client.clone();
    let read_ctx = Arc::clone(&ctx);
    let read_task = tokio::spawn(read_pump(stream, read_client, read_ctx));

    let reason = tokio::select! {
        result = read_task => result.unwrap_or(DisconnectReason::ReadError),
        result = write_task => result.unwrap_or(DisconnectReason::WriteError),
    };

    disconnect_client(&client, &ctx, reason);
    ctx.admission.task_finished();
}

async fn write_pump(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: OutboundReceiver,
    client: ClientHandle,
    ctx: Arc<ConnectionContext>,
    close_rx: CloseReceiver,
) -> DisconnectReason {
    let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
    ping_ticker.tick().await; // first tick fires immediately; discard it

    // `close_rx` resolves at most once; once it does (with or without a
    // code), stop polling it so a sender-dropped `Err` doesn't spin the
    // loop re-polling an already-completed oneshot every iteration.
    let mut close_rx = Some(close_rx);

    loop {
        // Biased so a pending outbound payload (e.g. the `system:error`
        // enqueued right before a protocol-violation close) always flushes
        // before the close frame that follows it (§6, S6).
        tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => return DisconnectReason::ServerShutdown,
            payload = outbound_rx.recv() => {
                let Some(payload) = payload else {
                    return DisconnectReason::ServerShutdown;
                };
                let envelope = MessageEnvelope::new(
                    client.next_seq(),
                    now_millis(),
                    payload.kind,
                    (*payload.body).clone(),
                );
                let Ok(text) = serde_json::to_string(&envelope) else {
                    warn!(client_id = client.id(), "failed to serialize outbound envelope");
                    continue;
                };
                let len = text.len();
                let write = sink.send(Message::Text(text.into()));
                if tokio::time::timeout(WRITE_TIMEOUT, write).await.is_err() {
                    return DisconnectReason::WriteError;
                }
                client.record_sent(len);
                ctx.metrics.messages_sent_total.increment(1);
                ctx.metrics.bytes_sent_total.increment(len as u64);
            }
            result = async {
                match close_rx.as_mut() {
                    Some(rx) => rx.await,
                    None => std::future::pending().await,
                }
            } => {
                close_rx = None;
                if let Ok((code, reason)) = result {
                    let frame = CloseFrame { code, reason: "".into() };
                    let _ = tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await;
                    return reason;
                }
            }
            _ = ping_ticker.tick() => {
                if tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Ping(Vec::new().into())))
                    .await
                    .is_err()
                {
                    return DisconnectReason::WriteError;
                }
            }
        }
    }
}

async fn read_pump(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    client: ClientHandle,
    ctx: Arc<ConnectionContext>,
) -> DisconnectReason {
    loop {
        let next = tokio::time::timeout(READ_IDLE_TIMEOUT, stream.next()).await;
        let Ok(next) = next else {
            return DisconnectReason::ReadError;
        };
        let Some(frame) = next else {
            return DisconnectReason::ClientClose;
        };

        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                warn!(client_id = client.id(), error = %err, "websocket read error");
                return DisconnectReason::ReadError;
            }
        };

        match message {
            Message::Text(text) => {
                if let Err(err) =
                    protocol::handle_text_message(&client, &ctx.index, &ctx.kafka_brokers, &text)
                        .await
                {
                    let _ = client.try_send(protocol::system_error_payload(&err));
                    client.request_close(err.close_code(), DisconnectReason::ProtocolViolation);
                    warn!(client_id = client.id(), error = %err, "protocol violation");
                    return DisconnectReason::ProtocolViolation;
                }
            }
            Message::Binary(_) => {
                let err = WsError::ProtocolViolation("binary frames unsupported".into());
                let _ = client.try_send(protocol::system_error_payload(&err));
                client.request_close(err.close_code(), DisconnectReason::ProtocolViolation);
                return DisconnectReason::ProtocolViolation;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Read deadline was already reset by receiving any frame
                // above; nothing else to do.
            }
            Message::Close(_) => return DisconnectReason::ClientClose,
        }
    }
}

fn disconnect_client(client: &ClientHandle, ctx: &ConnectionContext, reason: DisconnectReason) {
    if !client.begin_close() {
        return;
    }

    let channels = client.subscribed_channels();
    ctx.index
        .remove_client(client.id(), channels.iter().map(String::as_str));
    ctx.metrics.connections_active.decrement(1.0);
    ctx.admission.release_connection();
    ctx.slow_client_tracker
        .record(reason == DisconnectReason::SlowClientCritical);

    info!(
        client_id = client.id(),
        remote_addr = %client.remote_addr(),
        reason = reason.as_str(),
        duration_ms = client.connected_at().elapsed().as_millis() as u64,
        final_queue_depth = client.queue_depth(),
        sequence = client.current_seq(),
        subscription_count = channels.len(),
        "client disconnected"
    );
}
