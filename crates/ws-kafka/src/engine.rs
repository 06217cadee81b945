use crate::consumer::RecordStream;
use backon::{ExponentialBuilder, Retryable};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ws_core::{DecodedRecord, KafkaAdmission, KafkaRecordView};

/// Recv backoff: a handful of quick retries before surfacing the error up
/// to the consumer loop, which then restarts the whole `recv` (§4.3: one
/// consumer worker per stream, transient broker hiccups shouldn't tear the
/// loop down).
fn recv_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(3)
}

async fn recv_with_retry(stream: &dyn RecordStream) -> anyhow::Result<KafkaRecordView> {
    (|| async { stream.recv().await })
        .retry(recv_backoff())
        .notify(|err: &anyhow::Error, dur: Duration| {
            warn!(error = %err, delay = ?dur, "retrying Kafka recv");
        })
        .await
}

/// Pull records from `stream`, apply the global Kafka rate limit, decode
/// the subject, hand off to `sink`, and commit only after a successful
/// hand-off (§4.3). A `RateLimited` admission result NAKs the record
/// (skips the commit) rather than treating it as an error — Kafka
/// redelivers it once the consumer's ack-wait window elapses, which is the
/// intended backpressure path.
pub async fn run_consumer_loop(
    stream: Arc<dyn RecordStream>,
    admission: Arc<dyn KafkaAdmission>,
    sink: mpsc::Sender<DecodedRecord>,
    shutdown: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            () = shutdown.cancelled() => break,
            result = recv_with_retry(stream.as_ref()) => result,
        };

        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "Kafka recv failed after retries, continuing");
                continue;
            }
        };

        if admission.admit_kafka_record().is_err() {
            debug!(
                topic = %record.topic,
                offset = record.offset,
                "Kafka rate limit exceeded, NAKing record"
            );
            continue;
        }

        match ws_core::DecodedRecord::decode(record.clone()) {
            Ok(decoded) => {
                if sink.send(decoded).await.is_err() {
                    warn!("broadcast sink closed, stopping consumer loop");
                    break;
                }
            }
            Err(err) => {
                warn!(
                    topic = %record.topic,
                    error = %err,
                    "dropping record with malformed subject"
                );
            }
        }

        if let Err(err) = stream.commit(&record) {
            warn!(error = %err, "failed to commit Kafka offset");
        }
    }
}

/// Run `pool_size` consumer loops concurrently, all sharing the same
/// consumer group and fanning into the same sink — the "small fixed pool
/// (2-3)" of §4.3 for multi mode.
pub fn spawn_consumer_pool(
    streams: Vec<Arc<dyn RecordStream>>,
    admission: Arc<dyn KafkaAdmission>,
    sink: mpsc::Sender<DecodedRecord>,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    streams
        .into_iter()
        .map(|stream| {
            let admission = Arc::clone(&admission);
            let sink = sink.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(run_consumer_loop(stream, admission, sink, shutdown))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use ws_core::{KafkaRecordView, WsError};

    struct FakeStream {
        records: Mutex<Vec<KafkaRecordView>>,
        committed: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl RecordStream for FakeStream {
        async fn recv(&self) -> anyhow::Result<KafkaRecordView> {
            let mut records = self.records.lock().unwrap();
            if records.is_empty() {
                std::future::pending::<()>().await;
            }
            Ok(records.remove(0))
        }

        fn commit(&self, record: &KafkaRecordView) -> anyhow::Result<()> {
            self.committed.lock().unwrap().push(record.offset);
            Ok(())
        }
    }

    struct AlwaysAdmit;
    impl KafkaAdmission for AlwaysAdmit {
        fn admit_kafka_record(&self) -> Result<(), WsError> {
            Ok(())
        }
    }

    struct AlwaysReject;
    impl KafkaAdmission for AlwaysReject {
        fn admit_kafka_record(&self) -> Result<(), WsError> {
            Err(WsError::RateLimited("test".into()))
        }
    }

    fn record(topic: &str, offset: i64) -> KafkaRecordView {
        KafkaRecordView {
            topic: topic.to_string(),
            partition: 0,
            offset,
            key: None,
            value: bytes::Bytes::from_static(b"{}"),
            headers: Vec::new(),
            ts: 0,
        }
    }

    #[tokio::test]
    async fn decoded_records_are_forwarded_and_committed() {
        let stream = Arc::new(FakeStream {
            records: Mutex::new(vec![record("odin.token.BTC.trade", 5)]),
            committed: Mutex::new(Vec::new()),
        });
        let (tx, mut rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();

        let stream_clone = Arc::clone(&stream) as Arc<dyn RecordStream>;
        let handle = tokio::spawn(run_consumer_loop(
            stream_clone,
            Arc::new(AlwaysAdmit),
            tx,
            shutdown.clone(),
        ));

        let decoded = rx.recv().await.unwrap();
        assert_eq!(decoded.channel(), "BTC.trade");

        shutdown.cancel();
        let _ = handle.await;
        assert_eq!(*stream.committed.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn rate_limited_records_are_not_committed() {
        let stream = Arc::new(FakeStream {
            records: Mutex::new(vec![record("odin.token.BTC.trade", 9)]),
            committed: Mutex::new(Vec::new()),
        });
        let (tx, _rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();

        let stream_clone = Arc::clone(&stream) as Arc<dyn RecordStream>;
        let handle = tokio::spawn(run_consumer_loop(
            stream_clone,
            Arc::new(AlwaysReject),
            tx,
            shutdown.clone(),
        ));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        shutdown.cancel();
        let _ = handle.await;
        assert!(stream.committed.lock().unwrap().is_empty());
    }
}
