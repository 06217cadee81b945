use crate::error::WsError;
use std::net::IpAddr;

/// Global Kafka hand-off admission (§4.1, §4.3 step 1). Implemented by
/// `ws_resource_guard::ResourceGuard`; kept as a trait here so `ws-kafka`
/// doesn't need to depend on the resource-guard crate directly.
pub trait KafkaAdmission: Send + Sync {
    /// Check the global Kafka record rate budget.
    fn admit_kafka_record(&self) -> Result<(), WsError>;
}

/// Global broadcast admission (§4.1, §4.4).
pub trait BroadcastAdmission: Send + Sync {
    /// Check the global broadcast rate budget.
    fn admit_broadcast(&self) -> Result<(), WsError>;
}

/// Connection admission (§4.1, §4.7 step 1). Implemented by
/// `ws_resource_guard::ResourceGuard`; kept as a trait here so `ws-shard`
/// and `ws-balancer` depend on the admission surface, not the guard's full
/// sampling/config machinery.
pub trait ConnectionAdmission: Send + Sync {
    /// Admit a new connection from `remote_ip`, or reject with a
    /// classified [`WsError`] the caller maps to an HTTP/close code.
    fn admit_connection(&self, remote_ip: IpAddr) -> Result<(), WsError>;

    /// Release a slot acquired by a prior successful `admit_connection`.
    fn release_connection(&self);

    /// Record that a scheduler-visible task (a pump, a proxy loop) started,
    /// for the live-task count behind `max_goroutines` admission and
    /// `/health`'s `goroutines_percent` (§4.1). No-op by default so test
    /// fakes that only care about connection admission don't need to
    /// implement task bookkeeping.
    fn task_spawned(&self) {}

    /// Record that a scheduler-visible task exited.
    fn task_finished(&self) {}
}
