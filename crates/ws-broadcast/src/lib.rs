//! The broadcast fan-out stage (§4.4): each decoded Kafka record is
//! serialized into an envelope body exactly once, then handed to every
//! current subscriber of its channel through a priority-aware, non-blocking
//! enqueue onto that client's outbound queue.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use ws_core::{DecodedRecord, Priority};
use ws_subscription_index::{Subscriber, SubscriptionIndex};

/// How long a CRITICAL envelope is allowed to wait for queue space before
/// the client is judged slow and evicted (§4.4 step 3, CRITICAL branch).
pub const CRITICAL_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// A body serialized once per record, shared across every subscriber
/// (§4.4 step 1: "the JSON body MUST NOT be re-serialized per client").
#[derive(Debug, Clone)]
pub struct OutboundPayload {
    /// Envelope `type`, e.g. `"price:update"`.
    pub kind: &'static str,
    /// Delivery priority, used only to pick the enqueue policy — never
    /// serialized onto the wire.
    pub priority: Priority,
    /// Opaque decoded JSON body, shared via `Arc` across every enqueue.
    pub body: Arc<serde_json::Value>,
}

/// A fan-out destination: one non-blocking enqueue attempt, a bounded-wait
/// variant for CRITICAL envelopes, and a disconnect hook for the timeout
/// case. Implemented by the `Client` actor in `ws-shard`.
#[async_trait]
pub trait BroadcastTarget: Subscriber {
    /// Attempt to enqueue `payload` without blocking. Returns `false` if
    /// the outbound queue was full.
    fn try_enqueue(&self, payload: Arc<OutboundPayload>) -> bool;

    /// Attempt to enqueue `payload`, waiting up to `wait` for space. Used
    /// only for CRITICAL envelopes (§4.4).
    async fn enqueue_bounded(&self, payload: Arc<OutboundPayload>, wait: Duration) -> bool;

    /// Evict this client with reason `slow_client_critical` (§4.4, the
    /// CRITICAL-timeout path).
    fn disconnect_slow(&self);
}

/// Per-shard fan-out stage (§4.4). Each shard owns one `SubscriptionIndex`
/// and one `BroadcastBus`; `ws-kafka`'s consumer loop publishes every
/// decoded record to every shard's bus.
pub struct BroadcastBus<S: BroadcastTarget> {
    index: Arc<SubscriptionIndex<S>>,
}

impl<S: BroadcastTarget> std::fmt::Debug for BroadcastBus<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastBus").finish_non_exhaustive()
    }
}

impl<S: BroadcastTarget> BroadcastBus<S> {
    /// Build a bus over `index`.
    #[must_use]
    pub fn new(index: Arc<SubscriptionIndex<S>>) -> Self {
        Self { index }
    }

    /// Fan `record` out to its channel's current subscribers (§4.4 steps
    /// 1-3). A malformed JSON body is dropped with a warning — the subject
    /// was already validated by `DecodedRecord::decode`, so this only
    /// happens if the producer emitted a non-JSON value.
    pub async fn publish(&self, record: &DecodedRecord) {
        let channel = record.channel();
        let subscribers = self.index.get(&channel);
        if subscribers.is_empty() {
            return;
        }

        let body = match serde_json::from_slice::<serde_json::Value>(&record.record.value) {
            Ok(value) => value,
            Err(err) => {
                warn!(channel = %channel, error = %err, "dropping record with malformed JSON body");
                return;
            }
        };

        let payload = Arc::new(OutboundPayload {
            kind: "price:update",
            priority: record.priority,
            body: Arc::new(body),
        });

        for subscriber in subscribers.iter() {
            self.deliver(subscriber, &channel, Arc::clone(&payload)).await;
        }
    }

    async fn deliver(&self, subscriber: &S, channel: &str, payload: Arc<OutboundPayload>) {
        match payload.priority {
            Priority::Normal => {
                if !subscriber.try_enqueue(Arc::clone(&payload)) {
                    Self::record_drop(channel);
                }
            }
            Priority::High => {
                if !subscriber.try_enqueue(Arc::clone(&payload)) {
                    tokio::task::yield_now().await;
                    if !subscriber.try_enqueue(payload) {
                        Self::record_drop(channel);
                    }
                }
            }
            Priority::Critical => {
                if !subscriber
                    .enqueue_bounded(payload, CRITICAL_ENQUEUE_TIMEOUT)
                    .await
                {
                    warn!(channel = %channel, subscriber = subscriber.id(), "CRITICAL envelope undeliverable, evicting slow client");
                    subscriber.disconnect_slow();
                }
            }
        }
    }

    fn record_drop(channel: &str) {
        metrics::counter!("ws_dropped_broadcasts_total", "channel" => channel.to_string())
            .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use ws_core::KafkaRecordView;

    #[derive(Clone)]
    struct MockClient {
        id: u64,
        accept: Arc<AtomicBool>,
        delivered: Arc<AtomicUsize>,
        disconnected: Arc<AtomicBool>,
    }

    impl Subscriber for MockClient {
        fn id(&self) -> u64 {
            self.id
        }
    }

    #[async_trait]
    impl BroadcastTarget for MockClient {
        fn try_enqueue(&self, _payload: Arc<OutboundPayload>) -> bool {
            if self.accept.load(Ordering::Relaxed) {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                false
            }
        }

        async fn enqueue_bounded(&self, _payload: Arc<OutboundPayload>, _wait: Duration) -> bool {
            if self.accept.load(Ordering::Relaxed) {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                false
            }
        }

        fn disconnect_slow(&self) {
            self.disconnected.store(true, Ordering::Relaxed);
        }
    }

    fn decoded(topic: &str, body: &'static str) -> DecodedRecord {
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

    #[tokio::test]
    async fn normal_priority_delivers_to_every_subscriber() {
        let index: SubscriptionIndex<MockClient> = SubscriptionIndex::new(4);
        let client = MockClient {
            id: 1,
            accept: Arc::new(AtomicBool::new(true)),
            delivered: Arc::new(AtomicUsize::new(0)),
            disconnected: Arc::new(AtomicBool::new(false)),
        };
        index.add("BTC.liquidity", client.clone());
        let bus = BroadcastBus::new(Arc::new(index));

        bus.publish(&decoded("odin.token.BTC.liquidity", "{}")).await;

        assert_eq!(client.delivered.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn critical_priority_evicts_on_timeout() {
        let index: SubscriptionIndex<MockClient> = SubscriptionIndex::new(4);
        let client = MockClient {
            id: 2,
            accept: Arc::new(AtomicBool::new(false)),
            delivered: Arc::new(AtomicUsize::new(0)),
            disconnected: Arc::new(AtomicBool::new(false)),
        };
        index.add("BTC.order", client.clone());
        let bus = BroadcastBus::new(Arc::new(index));

        bus.publish(&decoded("odin.token.BTC.order", "{}")).await;

        assert!(client.disconnected.load(Ordering::Relaxed));
        assert_eq!(client.delivered.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn no_subscribers_is_a_no_op() {
        let index: SubscriptionIndex<MockClient> = SubscriptionIndex::new(4);
        let bus = BroadcastBus::new(Arc::new(index));
        bus.publish(&decoded("odin.token.BTC.trade", "{}")).await;
    }
}
