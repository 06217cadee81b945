//! Wire types, the Kafka subject grammar, the shared error taxonomy, and
//! the frozen process `Config` for the fan-out engine.

mod admission;
mod config;
mod envelope;
mod error;
mod record;
mod subject;

pub use admission::{BroadcastAdmission, ConnectionAdmission, KafkaAdmission};
pub use config::{Config, LogFormat, Mode};
pub use envelope::{
    ChannelsData, ClientMessage, MessageEnvelope, PingData, Priority, ReconnectAckData,
    ReconnectData, ReconnectErrorData, SystemErrorData,
};
pub use error::{DisconnectReason, WsError};
pub use record::{DecodedRecord, KafkaRecordView};
pub use subject::{Subject, VALID_EVENTS, parse_subject};

/// Current time in milliseconds since the Unix epoch, used for
/// server-assigned envelope timestamps (§3: "ts is server-assigned").
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A monotonic per-client sequence generator (§3). `next()` pre-increments
/// from 0, so the first call returns 1 and every subsequent call returns
/// the previous value plus one, with no gaps or duplicates for the life of
/// the connection (Testable Property 1, §8).
#[derive(Debug, Default)]
pub struct SequenceGenerator(std::sync::atomic::AtomicI64);

impl SequenceGenerator {
    /// A fresh generator starting at 0.
    #[must_use]
    pub const fn new() -> Self {
        Self(std::sync::atomic::AtomicI64::new(0))
    }

    /// Pre-increment and return the next sequence value.
    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1
    }

    /// The last value handed out by `next()`, without consuming one.
    /// Used for diagnostics (structured disconnect logs) only.
    #[must_use]
    pub fn current(&self) -> i64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
