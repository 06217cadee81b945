//! The channel → subscriber index (§4.2).
//!
//! Sharded by channel hash into `K` stripes (`K` a power of two, `K >=`
//! core count), each stripe behind its own `RwLock`. `get()` returns an
//! `Arc`-backed snapshot that's cheap to clone and safe to iterate without
//! holding the stripe lock, so broadcast reads never block subscribe
//! writes for long. The reverse index (which channels a client belongs to)
//! is owned by the caller (the `Client` actor in `ws-shard`), not by this
//! crate: [`SubscriptionIndex::remove_client`] takes that set as an
//! argument so it only ever touches the stripes the client actually
//! joined — never a full stripe scan (§9, "16-shard regression").

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Anything that can sit in the index: cheap to clone (an `Arc` handle in
/// practice) and identifiable for removal-by-id.
pub trait Subscriber: Clone + Send + Sync + 'static {
    /// Stable identity used to remove this subscriber from a channel
    /// without requiring `Eq`/`Hash` on the whole type.
    fn id(&self) -> u64;
}

struct Stripe<S: Subscriber> {
    channels: RwLock<HashMap<String, Arc<Vec<S>>>>,
}

impl<S: Subscriber> Default for Stripe<S> {
    fn default() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }
}

/// Channel → subscriber-set index, striped for concurrent access (§4.2).
pub struct SubscriptionIndex<S: Subscriber> {
    stripes: Vec<Stripe<S>>,
    mask: usize,
}

fn fnv1a(s: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in s.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn next_power_of_two(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

impl<S: Subscriber> SubscriptionIndex<S> {
    /// Build an index with `stripe_count` stripes, rounded up to the next
    /// power of two (minimum `num_cpus::get()`, per §4.2's concurrency
    /// note).
    #[must_use]
    pub fn new(stripe_count: usize) -> Self {
        let count = next_power_of_two(stripe_count.max(num_cpus::get()));
        Self {
            stripes: (0..count).map(|_| Stripe::default()).collect(),
            mask: count - 1,
        }
    }

    fn stripe_for(&self, channel: &str) -> &Stripe<S> {
        let index = (fnv1a(channel) as usize) & self.mask;
        &self.stripes[index]
    }

    /// Add `subscriber` to `channel`. Idempotent: subscribing the same
    /// subscriber id to the same channel twice does not duplicate it
    /// (§8: "subscribe(X) then subscribe(X) is idempotent").
    pub fn add(&self, channel: &str, subscriber: S) {
        let stripe = self.stripe_for(channel);
        let mut map = stripe.channels.write().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(channel.to_string()).or_default();
        if entry.iter().any(|existing| existing.id() == subscriber.id()) {
            return;
        }
        let mut next = (**entry).clone();
        next.push(subscriber);
        *entry = Arc::new(next);
    }

    /// Remove the subscriber identified by `subscriber_id` from `channel`.
    /// A no-op if it wasn't subscribed (§8: unsubscribe is a no-op ack).
    pub fn remove(&self, channel: &str, subscriber_id: u64) {
        let stripe = self.stripe_for(channel);
        let mut map = stripe.channels.write().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = map.get_mut(channel) else {
            return;
        };
        if !entry.iter().any(|s| s.id() == subscriber_id) {
            return;
        }
        let next: Vec<S> = entry.iter().filter(|s| s.id() != subscriber_id).cloned().collect();
        if next.is_empty() {
            map.remove(channel);
        } else {
            *entry = Arc::new(next);
        }
    }

    /// Snapshot of `channel`'s current subscribers, safe to iterate without
    /// holding any lock (§4.2 invariant 3).
    #[must_use]
    pub fn get(&self, channel: &str) -> Arc<Vec<S>> {
        let stripe = self.stripe_for(channel);
        let map = stripe.channels.read().unwrap_or_else(|e| e.into_inner());
        map.get(channel).cloned().unwrap_or_default()
    }

    /// Remove `subscriber_id` from exactly the channels in `channels` —
    /// the client's own reverse-subscription set — touching no other
    /// stripe (§4.2 invariant 2, §8 Testable Property 3).
    pub fn remove_client<'a>(
        &self,
        subscriber_id: u64,
        channels: impl IntoIterator<Item = &'a str>,
    ) {
        for channel in channels {
            self.remove(channel, subscriber_id);
        }
    }

    /// Number of stripes, for diagnostics/tests.
    #[must_use]
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Fake {
        id: u64,
        touches: Arc<AtomicUsize>,
    }

    impl Subscriber for Fake {
        fn id(&self) -> u64 {
            self.id
        }
    }

    fn fake(id: u64) -> Fake {
        Fake {
            id,
            touches: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[test]
    fn add_then_get_returns_the_subscriber() {
        let index: SubscriptionIndex<Fake> = SubscriptionIndex::new(4);
        index.add("BTC.trade", fake(1));
        let subs = index.get("BTC.trade");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id(), 1);
    }

    #[test]
    fn add_is_idempotent() {
        let index: SubscriptionIndex<Fake> = SubscriptionIndex::new(4);
        index.add("BTC.trade", fake(1));
        index.add("BTC.trade", fake(1));
        assert_eq!(index.get("BTC.trade").len(), 1);
    }

    #[test]
    fn unsubscribe_unknown_channel_is_a_no_op() {
        let index: SubscriptionIndex<Fake> = SubscriptionIndex::new(4);
        index.remove("ETH.trade", 1);
        assert_eq!(index.get("ETH.trade").len(), 0);
    }

    #[test]
    fn remove_client_touches_only_its_own_channels() {
        let index: SubscriptionIndex<Fake> = SubscriptionIndex::new(8);
        index.add("BTC.trade", fake(1));
        index.add("ETH.trade", fake(1));
        index.add("SOL.trade", fake(2));

        index.remove_client(1, ["BTC.trade", "ETH.trade"]);

        assert_eq!(index.get("BTC.trade").len(), 0);
        assert_eq!(index.get("ETH.trade").len(), 0);
        // Untouched: client 2's channel survives.
        assert_eq!(index.get("SOL.trade").len(), 1);
    }

    #[test]
    fn get_snapshot_is_independent_of_later_writes() {
        let index: SubscriptionIndex<Fake> = SubscriptionIndex::new(4);
        index.add("BTC.trade", fake(1));
        let snapshot = index.get("BTC.trade");
        index.add("BTC.trade", fake(2));
        assert_eq!(snapshot.len(), 1, "snapshot must not observe later writes");
        assert_eq!(index.get("BTC.trade").len(), 2);
    }

    #[test]
    fn stripe_count_is_power_of_two_and_at_least_core_count() {
        let index: SubscriptionIndex<Fake> = SubscriptionIndex::new(3);
        assert!(index.stripe_count().is_power_of_two());
        assert!(index.stripe_count() >= num_cpus::get());
    }
}
