//! Prometheus metric families and the `/health` aggregator (§4.8, §6).
//!
//! Unlabeled families live on the derived [`Metrics`] struct, matching
//! `crates/audit/src/metrics.rs`. The two labeled families
//! (`ws_dropped_broadcasts_total{channel}`, `ws_handshake_failures_total{shard}`)
//! are recorded with the raw `metrics::counter!` macro at their call sites
//! (`ws-broadcast`, `ws-balancer`) since `metrics-derive` doesn't support
//! per-call dynamic labels — the two free functions below exist so every
//! caller uses the same metric name and label key.

mod health;
mod tracker;

pub use health::{HealthInputs, HealthReport, HealthStatus, HealthThresholds};
pub use tracker::SlowClientTracker;

use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Metrics for the `ws_fanout` component (§6's family list).
#[derive(Metrics, Clone)]
#[metrics(scope = "ws")]
pub struct Metrics {
    #[metric(describe = "Currently open WebSocket connections")]
    pub connections_active: Gauge,

    #[metric(describe = "Total WebSocket connections accepted since startup")]
    pub connections_total: Counter,

    #[metric(describe = "Total envelopes written to clients")]
    pub messages_sent_total: Counter,

    #[metric(describe = "Total bytes written to clients")]
    pub bytes_sent_total: Counter,

    #[metric(describe = "Outbound queue depth samples")]
    pub worker_queue_depth: Histogram,

    #[metric(describe = "Outbound queue utilization, percent of capacity")]
    pub worker_queue_utilization_percent: Gauge,

    #[metric(describe = "Sampled container/host CPU usage, percent")]
    pub cpu_usage_percent: Gauge,

    #[metric(describe = "Current resident memory, bytes")]
    pub memory_bytes: Gauge,

    #[metric(describe = "Live scheduler-visible tasks (pumps, proxy loops)")]
    pub goroutines_active: Gauge,

    #[metric(describe = "1 if the shared Kafka consumer is connected, else 0")]
    pub kafka_connected: Gauge,
}

/// Record a dropped broadcast for `channel` (§4.4).
pub fn record_dropped_broadcast(channel: &str) {
    metrics::counter!("ws_dropped_broadcasts_total", "channel" => channel.to_string()).increment(1);
}

/// Record a backend handshake failure for `shard` (§4.7 step 3).
pub fn record_handshake_failure(shard: &str) {
    metrics::counter!("ws_handshake_failures_total", "shard" => shard.to_string()).increment(1);
}

/// Install the Prometheus HTTP exporter at `addr`, matching
/// `crates/audit/src/metrics.rs::init_prometheus_exporter`.
pub fn init_prometheus_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|err| anyhow::anyhow!("failed to install Prometheus exporter: {err}"))
}
