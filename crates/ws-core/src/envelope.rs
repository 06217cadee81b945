use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Server-internal delivery priority (§3, §4.4). Never serialized: no
/// client-observable part of the wire contract depends on its presence, so
/// unlike the Go original's `omitempty` field we simply don't emit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// `trade` events and anything else that tolerates drops under load.
    Normal,
    /// `trade`-adjacent events: retried once before dropping.
    High,
    /// `order`/`balances` events: never silently dropped, evicts slow
    /// clients instead.
    Critical,
}

impl Priority {
    /// Priority derived from a Kafka subject's event segment (§4.3 step 3).
    #[must_use]
    pub fn for_event(event: &str) -> Self {
        match event {
            "trade" => Self::High,
            "order" | "balances" => Self::Critical,
            _ => Self::Normal,
        }
    }
}

/// The wire envelope every server-to-client message is wrapped in (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Strictly increasing per-client sequence number.
    pub seq: i64,
    /// Server-assigned send timestamp, milliseconds since epoch.
    pub ts: i64,
    /// Envelope kind, e.g. `"price:update"`, `"subscribe_ack"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload.
    pub data: serde_json::Value,
}

impl MessageEnvelope {
    /// Build an envelope with the next sequence number and current time.
    #[must_use]
    pub fn new(seq: i64, ts: i64, kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            seq,
            ts,
            kind: kind.into(),
            data,
        }
    }
}

/// Channels payload shared by subscribe/unsubscribe requests and acks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsData {
    /// Channel strings of the form `SYMBOL.EVENT`.
    pub channels: Vec<String>,
}

/// `reconnect` request payload (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectData {
    /// Client-supplied identifier, echoed back in logs only.
    pub client_id: String,
    /// Last committed offset per Kafka topic the client observed.
    pub last_offset: HashMap<String, i64>,
}

/// `ping` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingData {
    /// Client-supplied timestamp, milliseconds since epoch.
    pub ts: i64,
}

/// Client → server messages (§6), tagged by `type`/`data` exactly as the
/// wire format specifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// `{"type":"subscribe","data":{"channels":[...]}}`
    Subscribe(ChannelsData),
    /// `{"type":"unsubscribe","data":{"channels":[...]}}`
    Unsubscribe(ChannelsData),
    /// `{"type":"ping","data":{"ts":...}}`
    Ping(PingData),
    /// `{"type":"reconnect","data":{"client_id":...,"last_offset":{...}}}`
    Reconnect(ReconnectData),
}

/// `reconnect_ack` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectAckData {
    /// Always `"completed"` on success (§6).
    pub status: &'static str,
    /// Count of replayed records, capped at 100 (§4.6 step 4).
    pub messages_replayed: usize,
}

/// `reconnect_error` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectErrorData {
    /// Human-readable failure reason.
    pub message: String,
}

/// `system:error` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemErrorData {
    /// Taxonomy tag, e.g. `"protocol_violation"`.
    pub code: String,
    /// Human-readable detail.
    pub message: String,
}
