use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;
use ws_core::{DecodedRecord, KafkaRecordView};

/// Hard caps on a single replay pass (§4.6 step 4).
pub const MAX_REPLAY_MESSAGES: usize = 100;
/// Hard wall-clock cap on a single replay pass.
pub const REPLAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Spin up a one-shot consumer from `last_offset`, read up to
/// [`MAX_REPLAY_MESSAGES`] records or [`REPLAY_TIMEOUT`] (whichever comes
/// first), and return them decoded. Never commits offsets — the consumer
/// is dropped at the end of this call (§4.6 steps 2,3,7).
///
/// Each topic in `last_offset` is assumed to be single-partition (the
/// wire `reconnect` payload carries no partition field, per §6's
/// `last_offset:{topic:offset}` shape) — partition 0 is seeked to
/// `offset + 1`, matching the subject grammar's one-symbol-per-topic
/// convention.
pub async fn replay(
    brokers: &str,
    last_offset: &HashMap<String, i64>,
) -> anyhow::Result<Vec<DecodedRecord>> {
    let group_id = format!(
        "replay-{}",
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    );

    let consumer: StreamConsumer = crate::consumer::base_client_config(brokers, &group_id).create()?;

    let mut assignment = TopicPartitionList::new();
    for topic in last_offset.keys() {
        assignment.add_partition(topic, 0);
    }
    consumer.assign(&assignment)?;

    for (topic, offset) in last_offset {
        if let Err(err) = consumer.seek(topic, 0, Offset::Offset(offset + 1), Duration::from_secs(5))
        {
            warn!(topic = %topic, error = %err, "replay seek failed, skipping topic");
        }
    }

    let mut decoded = Vec::new();
    let deadline = Instant::now() + REPLAY_TIMEOUT;

    while decoded.len() < MAX_REPLAY_MESSAGES {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let message = match tokio::time::timeout(remaining, consumer.recv()).await {
            Ok(Ok(message)) => message,
            Ok(Err(err)) => {
                warn!(error = %err, "replay consumer recv error");
                break;
            }
            Err(_) => break, // deadline elapsed
        };

        let view = KafkaRecordView {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: None,
            value: rdkafka::message::Message::payload(&message)
                .map(bytes::Bytes::copy_from_slice)
                .unwrap_or_default(),
            headers: Vec::new(),
            ts: 0,
        };

        match DecodedRecord::decode(view) {
            Ok(record) => decoded.push(record),
            Err(err) => warn!(error = %err, "skipping malformed record during replay"),
        }
    }

    // `consumer` drops here without ever being committed.
    Ok(decoded)
}
