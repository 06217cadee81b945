//! The process-wide admission and backpressure oracle (§4.1).
//!
//! `ResourceGuard` samples container CPU%, memory/limit ratio, and live
//! task count at a 100 ms cadence on a background task, and exposes cheap
//! atomic reads (`cpu_overloaded`) for hot paths. Connection admission and
//! the Kafka/broadcast rate limits are synchronous, lock-light checks.

use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::state::keyed::DefaultKeyedStateStore;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ws_core::WsError;
use ws_platform::ContainerCpuSource;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Tunables the guard enforces; a subset of [`ws_core::Config`] so this
/// crate doesn't need to depend on the full config surface.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Reject new connections once CPU% reaches this threshold.
    pub cpu_reject_threshold: f64,
    /// `cpu_overloaded()` flips true at this (lower) threshold, ahead of
    /// the hard reject line, so callers can shed proactively.
    pub cpu_pause_threshold: f64,
    /// Memory limit in bytes; `0` defers to `ws_platform::discover_memory_limit_bytes`.
    pub memory_limit_bytes: u64,
    /// Hard ceiling on concurrently admitted connections.
    pub max_connections: u64,
    /// Hard ceiling on concurrently live tasks.
    pub max_goroutines: u64,
    /// New-connection token bucket refill rate per source IP, per second.
    pub per_ip_connection_rate: u32,
    /// Global Kafka hand-off rate limit, records/sec.
    pub max_kafka_rate: u32,
    /// Global broadcast rate limit, envelopes/sec.
    pub max_broadcast_rate: u32,
}

/// The process-wide admission oracle (§4.1).
pub struct ResourceGuard {
    config: GuardConfig,
    cpu_reject: AtomicBool,
    cpu_paused: AtomicBool,
    memory_overloaded: AtomicBool,
    connections: AtomicU64,
    tasks: AtomicU64,
    memory_limit_bytes: u64,
    per_ip_buckets: KeyedLimiter,
    kafka_bucket: DirectLimiter,
    broadcast_bucket: DirectLimiter,
    last_cpu_percent_bits: AtomicU64,
    last_memory_ratio_bits: AtomicU64,
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("cpu_reject", &self.cpu_reject.load(Ordering::Relaxed))
            .field("cpu_paused", &self.cpu_paused.load(Ordering::Relaxed))
            .field("connections", &self.connections.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn rate_quota(per_second: u32) -> Quota {
    Quota::per_second(NonZeroU32::new(per_second.max(1)).unwrap_or(NonZeroU32::MIN))
}

impl ResourceGuard {
    /// Build a guard with caps from `config`. Does not start sampling;
    /// call [`ResourceGuard::spawn_sampler`] once, from the lifecycle glue.
    #[must_use]
    pub fn new(config: GuardConfig) -> Self {
        let memory_limit_bytes = if config.memory_limit_bytes > 0 {
            config.memory_limit_bytes
        } else {
            ws_platform::discover_memory_limit_bytes()
        };

        Self {
            per_ip_buckets: RateLimiter::keyed(rate_quota(config.per_ip_connection_rate)),
            kafka_bucket: RateLimiter::direct(rate_quota(config.max_kafka_rate)),
            broadcast_bucket: RateLimiter::direct(rate_quota(config.max_broadcast_rate)),
            config,
            cpu_reject: AtomicBool::new(false),
            cpu_paused: AtomicBool::new(false),
            memory_overloaded: AtomicBool::new(false),
            connections: AtomicU64::new(0),
            tasks: AtomicU64::new(0),
            memory_limit_bytes,
            last_cpu_percent_bits: AtomicU64::new(0),
            last_memory_ratio_bits: AtomicU64::new(0),
        }
    }

    /// Spawn the 100 ms sampler task. Sampling failures log once per
    /// minute and default `cpu_overloaded` to `false` (fail-open for
    /// availability) without disabling the hard connection/task caps,
    /// which are counted cheaply regardless (§4.1 Failure policy).
    pub fn spawn_sampler(
        self: &Arc<Self>,
        mut cpu_source: Box<dyn ContainerCpuSource>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let guard = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            let mut last_error_log = tokio::time::Instant::now() - Duration::from_secs(120);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match cpu_source.sample() {
                    Some(sample) => {
                        guard
                            .cpu_reject
                            .store(sample.percent >= guard.config.cpu_reject_threshold, Ordering::Relaxed);
                        guard
                            .cpu_paused
                            .store(sample.percent >= guard.config.cpu_pause_threshold, Ordering::Relaxed);
                        guard
                            .last_cpu_percent_bits
                            .store(sample.percent.to_bits(), Ordering::Relaxed);
                    }
                    None => {
                        guard.cpu_reject.store(false, Ordering::Relaxed);
                        guard.cpu_paused.store(false, Ordering::Relaxed);
                        guard.last_cpu_percent_bits.store(0.0_f64.to_bits(), Ordering::Relaxed);
                        if last_error_log.elapsed() >= Duration::from_secs(60) {
                            warn!(source = cpu_source.name(), "CPU sample unavailable this tick; failing open");
                            last_error_log = tokio::time::Instant::now();
                        }
                    }
                }

                let rss = ws_platform::current_rss_bytes();
                let ratio = rss as f64 / guard.memory_limit_bytes.max(1) as f64;
                guard.memory_overloaded.store(ratio >= 1.0, Ordering::Relaxed);
                guard
                    .last_memory_ratio_bits
                    .store(ratio.to_bits(), Ordering::Relaxed);
            }
            info!("ResourceGuard sampler stopped");
        })
    }

    /// Cheap atomic read of the hard CPU-reject flag; safe to call from hot
    /// paths (§4.1: "hot-path callers never touch cgroup files").
    #[must_use]
    pub fn cpu_overloaded(&self) -> bool {
        self.cpu_reject.load(Ordering::Relaxed)
    }

    /// Cheap atomic read of the proactive-shedding flag, which flips true
    /// at the lower `cpu_pause_threshold`, ahead of the hard reject line.
    /// Callers that can shed load gracefully (e.g. pausing non-critical
    /// broadcast work) should watch this instead of waiting for rejection.
    #[must_use]
    pub fn cpu_paused(&self) -> bool {
        self.cpu_paused.load(Ordering::Relaxed)
    }

    /// Current admitted-connection count.
    #[must_use]
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Current live-task count, as reported by callers via
    /// [`ResourceGuard::task_spawned`] / [`ResourceGuard::task_finished`].
    #[must_use]
    pub fn task_count(&self) -> u64 {
        self.tasks.load(Ordering::Relaxed)
    }

    /// Most recent CPU sample, percent. `0.0` until the sampler has
    /// ticked once or whenever the last tick failed (§4.8 `/health`).
    #[must_use]
    pub fn cpu_percent(&self) -> f64 {
        f64::from_bits(self.last_cpu_percent_bits.load(Ordering::Relaxed))
    }

    /// Most recent resident-memory/limit ratio, as a fraction of 1.0.
    #[must_use]
    pub fn memory_ratio(&self) -> f64 {
        f64::from_bits(self.last_memory_ratio_bits.load(Ordering::Relaxed))
    }

    /// Admitted connections as a percent of the configured cap.
    #[must_use]
    pub fn capacity_percent(&self) -> f64 {
        100.0 * self.connection_count() as f64 / self.config.max_connections.max(1) as f64
    }

    /// Live tasks as a percent of the configured cap.
    #[must_use]
    pub fn goroutines_percent(&self) -> f64 {
        100.0 * self.task_count() as f64 / self.config.max_goroutines.max(1) as f64
    }

    /// Record that a scheduler-visible task (pump, proxy loop) started.
    pub fn task_spawned(&self) {
        self.tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a scheduler-visible task exited.
    pub fn task_finished(&self) {
        self.tasks.fetch_sub(1, Ordering::Relaxed);
    }

    /// Admit a new connection from `remote_ip`. Loopback IPs bypass the
    /// per-IP token bucket (§4.1): the in-process `LoadBalancer` dials
    /// shards from loopback and must never be rate-limited against
    /// itself.
    pub fn admit_connection(&self, remote_ip: IpAddr) -> Result<(), WsError> {
        if self.connections.load(Ordering::Relaxed) >= self.config.max_connections {
            return Err(WsError::BackpressureRejected(
                "connection cap reached".into(),
            ));
        }
        if self.tasks.load(Ordering::Relaxed) >= self.config.max_goroutines {
            return Err(WsError::ResourceExhausted("task cap reached".into()));
        }
        if self.cpu_reject.load(Ordering::Relaxed) {
            return Err(WsError::BackpressureRejected("CPU overloaded".into()));
        }
        if self.memory_overloaded.load(Ordering::Relaxed) {
            return Err(WsError::BackpressureRejected("memory overloaded".into()));
        }
        if !remote_ip.is_loopback() && self.per_ip_buckets.check_key(&remote_ip).is_err() {
            return Err(WsError::RateLimited(format!(
                "per-IP connection rate exceeded for {remote_ip}"
            )));
        }

        self.connections.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release an admission slot acquired by [`ResourceGuard::admit_connection`].
    /// Idempotent at the call site's discretion — callers should call this
    /// exactly once per successful admission.
    pub fn release_connection(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Global Kafka hand-off rate limit (§4.3 step 1). On `RateLimited`
    /// the caller should NAK and let Kafka redeliver.
    pub fn admit_kafka_record(&self) -> Result<(), WsError> {
        self.kafka_bucket
            .check()
            .map_err(|_| WsError::RateLimited("global Kafka rate exceeded".into()))
    }

    /// Global broadcast rate limit.
    pub fn admit_broadcast(&self) -> Result<(), WsError> {
        self.broadcast_bucket
            .check()
            .map_err(|_| WsError::RateLimited("global broadcast rate exceeded".into()))
    }
}

impl ws_core::KafkaAdmission for ResourceGuard {
    fn admit_kafka_record(&self) -> Result<(), WsError> {
        Self::admit_kafka_record(self)
    }
}

impl ws_core::BroadcastAdmission for ResourceGuard {
    fn admit_broadcast(&self) -> Result<(), WsError> {
        Self::admit_broadcast(self)
    }
}

impl ws_core::ConnectionAdmission for ResourceGuard {
    fn admit_connection(&self, remote_ip: std::net::IpAddr) -> Result<(), WsError> {
        Self::admit_connection(self, remote_ip)
    }

    fn release_connection(&self) {
        Self::release_connection(self);
    }

    fn task_spawned(&self) {
        Self::task_spawned(self);
    }

    fn task_finished(&self) {
        Self::task_finished(self);
    }
}
