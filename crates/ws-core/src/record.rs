use crate::{Priority, Subject, parse_subject};
use bytes::Bytes;

/// A Kafka record as seen by the consumer, before channel/priority
/// derivation (§3 "Kafka record (internal)").
#[derive(Debug, Clone)]
pub struct KafkaRecordView {
    /// Source topic, expected to match the subject grammar (§6).
    pub topic: String,
    /// Partition the record was read from.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Record key, if present.
    pub key: Option<Bytes>,
    /// Record value (the opaque JSON payload forwarded as envelope `data`).
    pub value: Bytes,
    /// Record headers.
    pub headers: Vec<(String, Bytes)>,
    /// Broker-assigned timestamp, milliseconds since epoch.
    pub ts: i64,
}

/// A record after subject decoding and priority derivation, ready to hand
/// off to the `BroadcastBus` (§4.3 steps 2-3).
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    /// The originating record, kept for replay/offset bookkeeping.
    pub record: KafkaRecordView,
    /// Decoded `odin.<type>.<symbol>.<event>` subject.
    pub subject: Subject,
    /// Derived priority for the broadcast fan-out (§4.3 step 3).
    pub priority: Priority,
}

impl DecodedRecord {
    /// Decode `record`'s topic into a subject and derive its priority.
    /// Returns `Err` for a malformed topic (§4.3 step 2: "drop with
    /// warning metric").
    pub fn decode(record: KafkaRecordView) -> Result<Self, crate::WsError> {
        let subject = parse_subject(&record.topic)?;
        let priority = Priority::for_event(&subject.event);
        Ok(Self {
            record,
            subject,
            priority,
        })
    }

    /// The subscription channel this record should fan out to.
    #[must_use]
    pub fn channel(&self) -> String {
        self.subject.channel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str) -> KafkaRecordView {
        KafkaRecordView {
            topic: topic.to_string(),
            partition: 0,
            offset: 1,
            key: None,
            value: Bytes::from_static(b"{}"),
            headers: Vec::new(),
            ts: 0,
        }
    }

    #[test]
    fn decode_derives_channel_and_priority() {
        let decoded = DecodedRecord::decode(record("odin.token.BTC.trade")).unwrap();
        assert_eq!(decoded.channel(), "BTC.trade");
        assert_eq!(decoded.priority, Priority::High);
    }

    #[test]
    fn decode_rejects_malformed_topic() {
        assert!(DecodedRecord::decode(record("garbage")).is_err());
    }
}
