//! The per-connection `Client` actor state (§3 `Client`, §4.5).

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use ws_broadcast::{BroadcastTarget, OutboundPayload};
use ws_core::{DisconnectReason, SequenceGenerator, WsError};
use ws_subscription_index::Subscriber;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Sender half of a client's outbound queue (§3: capacity
/// `WS_WORKER_QUEUE_SIZE`, 512 by default).
pub type OutboundSender = mpsc::Sender<Arc<OutboundPayload>>;
/// Receiver half, owned by the writePump.
pub type OutboundReceiver = mpsc::Receiver<Arc<OutboundPayload>>;
/// Receiver half of a client's close signal, owned by the writePump
/// (§4.4, §4.5, §6): carries the WebSocket close code and classified
/// reason for a server-initiated disconnect (protocol violation, slow
/// client eviction).
pub type CloseReceiver = oneshot::Receiver<(u16, DisconnectReason)>;

struct Inner {
    id: u64,
    remote_addr: SocketAddr,
    connected_at: Instant,
    outbound: OutboundSender,
    sequence: SequenceGenerator,
    subscriptions: RwLock<HashSet<String>>,
    /// Guards `disconnectClient` so it runs exactly once regardless of
    /// which pump (or the broadcast bus) observes the failure first
    /// (§4.5: "guarded by `closeOnce`"). `std::sync::Once` isn't
    /// async-aware, so the idiomatic Rust equivalent is a single atomic
    /// compare-exchange that the first caller wins.
    close_started: AtomicBool,
    /// First caller wins, same as `close_started` but for the writePump's
    /// close signal: whichever of (protocol violation, slow-client
    /// eviction, ...) fires first takes the sender, the rest are no-ops.
    close_tx: Mutex<Option<oneshot::Sender<(u16, DisconnectReason)>>>,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

/// A cheaply-clonable handle to a connection's actor state. Both pumps,
/// the protocol handler, and the `BroadcastBus` hold a clone; the last one
/// dropped frees the connection's resources.
#[derive(Clone)]
pub struct ClientHandle(Arc<Inner>);

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.0.id)
            .field("remote_addr", &self.0.remote_addr)
            .finish_non_exhaustive()
    }
}

impl ClientHandle {
    /// Allocate a new client with a fresh id and outbound queue of
    /// `queue_capacity` slots, returning the handle, the outbound receiver
    /// the writePump should own, and the close-signal receiver the
    /// writePump should race against it (§4.5, §6).
    #[must_use]
    pub fn new(remote_addr: SocketAddr, queue_capacity: usize) -> (Self, OutboundReceiver, CloseReceiver) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let (close_tx, close_rx) = oneshot::channel();
        let inner = Inner {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            connected_at: Instant::now(),
            outbound: tx,
            sequence: SequenceGenerator::new(),
            subscriptions: RwLock::new(HashSet::new()),
            close_started: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        };
        (Self(Arc::new(inner)), rx, close_rx)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.0.remote_addr
    }

    #[must_use]
    pub fn connected_at(&self) -> Instant {
        self.0.connected_at
    }

    /// Next `seq` value, stamped immediately before a payload is flushed
    /// to the socket (§4.5 "Sequence contract").
    pub fn next_seq(&self) -> i64 {
        self.0.sequence.next()
    }

    /// The last `seq` value handed out, without consuming one. Used for
    /// the structured disconnect log (§4.5).
    #[must_use]
    pub fn current_seq(&self) -> i64 {
        self.0.sequence.current()
    }

    /// Add `channel` to this client's reverse-subscription set.
    pub fn subscribe(&self, channel: &str) {
        self.0
            .subscriptions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(channel.to_string());
    }

    /// Remove `channel` from this client's reverse-subscription set.
    pub fn unsubscribe(&self, channel: &str) {
        self.0
            .subscriptions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(channel);
    }

    /// Snapshot of the client's current channel subscriptions, handed to
    /// `SubscriptionIndex::remove_client` on teardown (§4.2, §4.5).
    #[must_use]
    pub fn subscribed_channels(&self) -> Vec<String> {
        self.0
            .subscriptions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.0
            .subscriptions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Current outbound queue depth, sampled for the
    /// `ws_worker_queue_depth` histogram.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.0.outbound.max_capacity() - self.0.outbound.capacity()
    }

    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.0.outbound.max_capacity()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.0.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.0.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.0.messages_sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.0.bytes_sent.load(Ordering::Relaxed)
    }

    /// Win the close race, if nobody has won it yet. The caller that gets
    /// `true` back is responsible for running `disconnectClient` (§4.5).
    pub fn begin_close(&self) -> bool {
        self.0
            .close_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Queue a payload for delivery without blocking (used by the NORMAL
    /// and HIGH broadcast paths through the `BroadcastTarget` impl below,
    /// and directly for server-generated acks/errors).
    pub fn try_send(&self, payload: Arc<OutboundPayload>) -> bool {
        self.0.outbound.try_send(payload).is_ok()
    }

    /// Ask the owning writePump to close the connection with `code`,
    /// tagging the eventual disconnect log with `reason` (§4.4, §6). Only
    /// the first request wins; later ones (e.g. a protocol violation
    /// racing a slow-client eviction) are silently dropped.
    pub fn request_close(&self, code: u16, reason: DisconnectReason) {
        if let Some(tx) = self
            .0
            .close_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            let _ = tx.send((code, reason));
        }
    }
}

impl Subscriber for ClientHandle {
    fn id(&self) -> u64 {
        self.0.id
    }
}

#[async_trait]
impl BroadcastTarget for ClientHandle {
    fn try_enqueue(&self, payload: Arc<OutboundPayload>) -> bool {
        self.try_send(payload)
    }

    async fn enqueue_bounded(&self, payload: Arc<OutboundPayload>, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.0.outbound.send(payload))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    fn disconnect_slow(&self) {
        tracing::warn!(
            client_id = self.id(),
            reason = DisconnectReason::SlowClientCritical.as_str(),
            "evicting slow client: CRITICAL envelope exceeded bounded wait"
        );
        let code = WsError::SlowClientEvicted("CRITICAL envelope exceeded bounded wait".into())
            .close_code();
        self.request_close(code, DisconnectReason::SlowClientCritical);
    }
}
