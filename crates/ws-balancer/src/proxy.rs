//! Backend dialing and bidirectional frame copy (§4.7 steps 3-4).

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use ws_core::ConnectionAdmission;
use ws_shard::Shard;

type Backend = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Try each shard in `ordered` at most once, returning the first backend
/// that completes a handshake (§4.7 step 3).
pub async fn dial_any_shard(ordered: &[Arc<Shard>]) -> Option<(Backend, usize)> {
    for shard in ordered {
        let url = format!("ws://{}/ws", shard.bind_addr);
        match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _response)) => return Some((stream, shard.id)),
            Err(err) => {
                warn!(shard_id = shard.id, error = %err, "backend handshake failed, trying next shard");
                ws_metrics::record_handshake_failure(&shard.id.to_string());
            }
        }
    }
    None
}

/// Copy frames bidirectionally between the public `client` socket and the
/// backend shard connection until either side closes (§4.7 step 4).
/// Counted as one scheduler-visible task against `max_goroutines` for the
/// lifetime of the proxy loop (§4.1, §5).
pub async fn copy_bidirectional(
    client: WebSocket,
    backend: Backend,
    shutdown: CancellationToken,
    admission: Arc<dyn ConnectionAdmission>,
) {
    admission.task_spawned();

    let (mut client_sink, mut client_stream) = client.split();
    let (mut backend_sink, mut backend_stream) = backend.split();

    let client_to_backend = async {
        while let Some(Ok(msg)) = client_stream.next().await {
            let Some(msg) = to_tungstenite(msg) else {
                continue;
            };
            if backend_sink.send(msg).await.is_err() {
                break;
            }
        }
    };

    let backend_to_client = async {
        while let Some(Ok(msg)) = backend_stream.next().await {
            let Some(msg) = to_axum(msg) else {
                continue;
            };
            if client_sink.send(msg).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        () = shutdown.cancelled() => {}
        () = client_to_backend => {}
        () = backend_to_client => {}
    }

    admission.task_finished();
}

fn to_tungstenite(msg: AxumMessage) -> Option<TungsteniteMessage> {
    Some(match msg {
        AxumMessage::Text(text) => TungsteniteMessage::Text(text.to_string().into()),
        AxumMessage::Binary(data) => TungsteniteMessage::Binary(data),
        AxumMessage::Ping(data) => TungsteniteMessage::Ping(data),
        AxumMessage::Pong(data) => TungsteniteMessage::Pong(data),
        AxumMessage::Close(frame) => TungsteniteMessage::Close(frame.map(|f| TungsteniteCloseFrame {
            code: f.code.into(),
            reason: f.reason.to_string().into(),
        })),
    })
}

fn to_axum(msg: TungsteniteMessage) -> Option<AxumMessage> {
    Some(match msg {
        TungsteniteMessage::Text(text) => AxumMessage::Text(text.to_string().into()),
        TungsteniteMessage::Binary(data) => AxumMessage::Binary(data),
        TungsteniteMessage::Ping(data) => AxumMessage::Ping(data),
        TungsteniteMessage::Pong(data) => AxumMessage::Pong(data),
        TungsteniteMessage::Close(frame) => AxumMessage::Close(frame.map(|f| AxumCloseFrame {
            code: f.code.into(),
            reason: f.reason.to_string().into(),
        })),
        TungsteniteMessage::Frame(_) => return None,
    })
}
