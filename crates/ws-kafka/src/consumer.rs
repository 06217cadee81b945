use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, TopicPartitionList};
use ws_core::KafkaRecordView;

/// Abstracts Kafka consumption so the engine can be driven by a mock in
/// tests, mirroring `account-abstraction-core`'s `KafkaConsumer` trait.
#[async_trait]
pub trait RecordStream: Send + Sync {
    /// Block until the next record is available.
    async fn recv(&self) -> anyhow::Result<KafkaRecordView>;

    /// Commit `record`'s offset (i.e. `offset + 1`) for its topic/partition.
    /// Only called after a successful hand-off to the broadcast bus
    /// (§4.3 step 4).
    fn commit(&self, record: &KafkaRecordView) -> anyhow::Result<()>;
}

/// Build a base `rdkafka` client config for a consumer group, with the
/// bounded-batch fetch tunables from §4.3 ("up to 100 records or 50 ms").
#[must_use]
pub fn base_client_config(brokers: &str, group_id: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", brokers)
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("fetch.wait.max.ms", "50")
        .set("fetch.message.max.bytes", "1048576")
        .set("session.timeout.ms", "10000");
    config
}

/// A `StreamConsumer`-backed [`RecordStream`].
pub struct RdKafkaConsumer {
    consumer: StreamConsumer,
}

impl RdKafkaConsumer {
    /// Create a consumer subscribed to `topics` under `group_id`.
    pub fn new(brokers: &str, group_id: &str, topics: &[String]) -> anyhow::Result<Self> {
        let consumer: StreamConsumer = base_client_config(brokers, group_id).create()?;
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;
        Ok(Self { consumer })
    }

    fn to_view(message: &BorrowedMessage<'_>) -> KafkaRecordView {
        KafkaRecordView {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| bytes::Bytes::copy_from_slice(k)),
            value: message
                .payload()
                .map(bytes::Bytes::copy_from_slice)
                .unwrap_or_default(),
            headers: message
                .headers()
                .map(|headers| {
                    (0..headers.count())
                        .filter_map(|i| {
                            let header = headers.get(i);
                            header.value.map(|v| {
                                (header.key.to_string(), bytes::Bytes::copy_from_slice(v))
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
            ts: message.timestamp().to_millis().unwrap_or(0),
        }
    }
}

#[async_trait]
impl RecordStream for RdKafkaConsumer {
    async fn recv(&self) -> anyhow::Result<KafkaRecordView> {
        let message = self.consumer.recv().await?;
        Ok(Self::to_view(&message))
    }

    fn commit(&self, record: &KafkaRecordView) -> anyhow::Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &record.topic,
            record.partition,
            rdkafka::Offset::Offset(record.offset + 1),
        )?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }
}
