use crate::error::WsError;
use clap::Parser;
use std::net::IpAddr;

/// Process mode (§2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// One server bound to one port, one Kafka consumer group.
    Single,
    /// An in-process `LoadBalancer` fronting N shards.
    Multi,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Newline-delimited JSON, for ingestion by log pipelines.
    Json,
    /// Human-readable text, for local development.
    Text,
}

/// The frozen process configuration, loaded once at startup from
/// environment variables (precedence: env > `.env` file > built-in
/// defaults, per §6). Missing or malformed required values abort the
/// process with `ConfigInvalid` rather than silently defaulting.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Kafka-to-WebSocket fan-out server")]
pub struct Config {
    /// `single` (one server) or `multi` (load balancer + shards).
    #[arg(long, env = "WS_MODE", value_enum, default_value = "single")]
    pub mode: Mode,

    /// Public bind address for the single-mode server or the multi-mode
    /// load balancer.
    #[arg(long, env = "WS_ADDR", default_value = "0.0.0.0:8080")]
    pub addr: String,

    /// First loopback port shards bind to in multi mode; shard `i` binds
    /// `127.0.0.1:{shard_base_port + i}`.
    #[arg(long, env = "SHARD_BASE_PORT", default_value_t = 9100)]
    pub shard_base_port: u16,

    /// Number of shards to run in multi mode.
    #[arg(long, env = "NUM_SHARDS", default_value_t = 1)]
    pub num_shards: usize,

    /// Comma-separated Kafka bootstrap broker list.
    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    pub kafka_brokers: String,

    /// Base consumer group id; replay consumers derive a unique throwaway
    /// group from this (`replay-<nanos>`) so they never affect committed
    /// offsets (§4.3).
    #[arg(long, env = "KAFKA_GROUP_ID", default_value = "ws-fanout")]
    pub kafka_group_id: String,

    /// Comma-separated list of Kafka topics to subscribe to.
    #[arg(long, env = "KAFKA_TOPICS", value_delimiter = ',')]
    pub kafka_topics: Vec<String>,

    /// Hard ceiling on concurrently admitted connections (per process in
    /// single mode, per shard in multi mode).
    #[arg(long, env = "WS_MAX_CONNECTIONS", default_value_t = 10_000)]
    pub max_connections: u64,

    /// Hard ceiling on concurrently live scheduler tasks, budgeted at 2 per
    /// connection in single mode and 4 in multi mode (§5).
    #[arg(long, env = "WS_MAX_GOROUTINES", default_value_t = 100_000)]
    pub max_goroutines: u64,

    /// Reject admission once container CPU usage reaches this percent.
    #[arg(long, env = "WS_CPU_REJECT_THRESHOLD", default_value_t = 90.0)]
    pub cpu_reject_threshold: f64,

    /// Advisory threshold below the reject threshold; hot paths read
    /// `CPUOverloaded()` against this value to decide whether to start
    /// shedding proactively.
    #[arg(long, env = "WS_CPU_PAUSE_THRESHOLD", default_value_t = 75.0)]
    pub cpu_pause_threshold: f64,

    /// Container memory limit in bytes; `0` means "discover from cgroup /
    /// host, no explicit override".
    #[arg(long, env = "WS_MEMORY_LIMIT", default_value_t = 0)]
    pub memory_limit_bytes: u64,

    /// Global Kafka hand-off rate limit, records/sec.
    #[arg(long, env = "WS_MAX_KAFKA_RATE", default_value_t = 50_000)]
    pub max_kafka_rate: u32,

    /// Global broadcast rate limit, envelopes/sec.
    #[arg(long, env = "WS_MAX_BROADCAST_RATE", default_value_t = 200_000)]
    pub max_broadcast_rate: u32,

    /// New-connection token bucket refill rate per source IP, per second.
    #[arg(long, env = "WS_WORKER_POOL_SIZE", default_value_t = 10)]
    pub per_ip_connection_rate: u32,

    /// Outbound queue capacity per client, in envelopes (§3).
    #[arg(long, env = "WS_WORKER_QUEUE_SIZE", default_value_t = 512)]
    pub outbound_queue_size: usize,

    /// TCP listen backlog for the public bind socket.
    #[arg(long, env = "TCP_LISTEN_BACKLOG", default_value_t = 1024)]
    pub tcp_listen_backlog: u32,

    /// HTTP server read timeout, seconds.
    #[arg(long, env = "HTTP_READ_TIMEOUT", default_value_t = 15)]
    pub http_read_timeout_secs: u64,

    /// HTTP server write timeout, seconds.
    #[arg(long, env = "HTTP_WRITE_TIMEOUT", default_value_t = 15)]
    pub http_write_timeout_secs: u64,

    /// HTTP server idle-connection timeout, seconds.
    #[arg(long, env = "HTTP_IDLE_TIMEOUT", default_value_t = 60)]
    pub http_idle_timeout_secs: u64,

    /// `trace`, `debug`, `info`, `warn`, or `error`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// `json` or `text`.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,

    /// Mount `/debug/pprof/*` flamegraph routes.
    #[arg(long, env = "ENABLE_PPROF", default_value_t = false)]
    pub enable_pprof: bool,

    /// Bind address for the standalone Prometheus exporter
    /// (`metrics-exporter-prometheus`'s own listener, §6). `/health` and
    /// `/debug/pprof/*` stay on the public router; only the scrape
    /// endpoint gets a dedicated port.
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: String,
}

impl Config {
    /// Cross-field invariants clap's per-field parsing can't express.
    /// Returns `ConfigInvalid` on the first violation; callers should
    /// abort the process on error (§6, §7).
    pub fn validate(&self) -> Result<(), WsError> {
        if self.mode == Mode::Multi && self.num_shards == 0 {
            return Err(WsError::ConfigInvalid(
                "NUM_SHARDS must be > 0 in multi mode".into(),
            ));
        }
        if self.mode == Mode::Single && self.num_shards > 1 {
            return Err(WsError::ConfigInvalid(
                "NUM_SHARDS must be <= 1 in single mode".into(),
            ));
        }
        if self.kafka_topics.is_empty() {
            return Err(WsError::ConfigInvalid(
                "KAFKA_TOPICS must name at least one topic".into(),
            ));
        }
        for threshold in [self.cpu_reject_threshold, self.cpu_pause_threshold] {
            if !(0.0..=100.0).contains(&threshold) {
                return Err(WsError::ConfigInvalid(format!(
                    "CPU thresholds must be in [0,100], got {threshold}"
                )));
            }
        }
        if self.cpu_pause_threshold > self.cpu_reject_threshold {
            return Err(WsError::ConfigInvalid(
                "WS_CPU_PAUSE_THRESHOLD must be <= WS_CPU_REJECT_THRESHOLD".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(WsError::ConfigInvalid(
                "WS_MAX_CONNECTIONS must be > 0".into(),
            ));
        }
        if self.outbound_queue_size == 0 {
            return Err(WsError::ConfigInvalid(
                "WS_WORKER_QUEUE_SIZE must be > 0".into(),
            ));
        }
        self.addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| WsError::ConfigInvalid(format!("WS_ADDR invalid: {e}")))?;
        self.metrics_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| WsError::ConfigInvalid(format!("METRICS_ADDR invalid: {e}")))?;
        Ok(())
    }

    /// Bind address for shard `index` in multi mode.
    #[must_use]
    pub fn shard_bind_addr(&self, index: usize) -> (IpAddr, u16) {
        (
            IpAddr::from([127, 0, 0, 1]),
            self.shard_base_port + u16::try_from(index).unwrap_or(u16::MAX),
        )
    }

    /// Advertise address shards are dialed on by the load balancer. Kept
    /// distinct from the bind address in principle (IPv4 vs IPv6 loopback
    /// mismatches, §4.7) even though both resolve to `127.0.0.1` today.
    #[must_use]
    pub fn shard_advertise_addr(&self, index: usize) -> (IpAddr, u16) {
        self.shard_bind_addr(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            mode: Mode::Single,
            addr: "0.0.0.0:8080".into(),
            shard_base_port: 9100,
            num_shards: 1,
            kafka_brokers: "localhost:9092".into(),
            kafka_group_id: "ws-fanout".into(),
            kafka_topics: vec!["odin.token.BTC.trade".into()],
            max_connections: 10_000,
            max_goroutines: 100_000,
            cpu_reject_threshold: 90.0,
            cpu_pause_threshold: 75.0,
            memory_limit_bytes: 0,
            max_kafka_rate: 50_000,
            max_broadcast_rate: 200_000,
            per_ip_connection_rate: 10,
            outbound_queue_size: 512,
            tcp_listen_backlog: 1024,
            http_read_timeout_secs: 15,
            http_write_timeout_secs: 15,
            http_idle_timeout_secs: 60,
            log_level: "info".into(),
            log_format: LogFormat::Json,
            enable_pprof: false,
            metrics_addr: "0.0.0.0:9090".into(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn multi_mode_requires_shards() {
        let mut config = base_config();
        config.mode = Mode::Multi;
        config.num_shards = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_topic_list_is_invalid() {
        let mut config = base_config();
        config.kafka_topics.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn pause_threshold_above_reject_is_invalid() {
        let mut config = base_config();
        config.cpu_pause_threshold = 95.0;
        config.cpu_reject_threshold = 90.0;
        assert!(config.validate().is_err());
    }
}
