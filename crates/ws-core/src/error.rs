use thiserror::Error;

/// Reasoning-only error taxonomy for the fan-out engine.
///
/// These names never appear on the wire; they exist so every layer of the
/// system classifies failures the same way (§7 of the design).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WsError {
    /// A one-off socket or Kafka I/O failure. Recoverable per-connection.
    #[error("transient i/o error: {0}")]
    TransientIO(String),

    /// The peer sent a frame or JSON payload that violates the client
    /// protocol (§6). Closes the connection with code 1008.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// `ResourceGuard` rejected admission due to CPU/memory/connection
    /// pressure.
    #[error("backpressure rejected: {0}")]
    BackpressureRejected(String),

    /// A token bucket (per-IP, Kafka, or broadcast) is exhausted.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A hard resource ceiling (goroutine/task budget, connection cap) was
    /// hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A CRITICAL-priority broadcast could not be delivered within the
    /// bounded wait; the client is evicted rather than left behind
    /// (§4.4). Closes the connection with code 4008.
    #[error("slow client evicted: {0}")]
    SlowClientEvicted(String),

    /// A `LoadBalancer` backend (shard) could not be reached.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The process is tearing down and no longer accepts work.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// A config value failed validation at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Anything else: a bug, a panic recovered from a spawned task, etc.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WsError {
    /// The WebSocket close code a server-initiated disconnect for this
    /// error should use, per §6.
    #[must_use]
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::TransientIO(_) => 1011,
            Self::ProtocolViolation(_) => 1008,
            Self::BackendUnavailable(_) => 1011,
            Self::BackpressureRejected(_) | Self::RateLimited(_) | Self::ResourceExhausted(_) => {
                1012
            }
            Self::SlowClientEvicted(_) => 4008,
            Self::ShutdownInProgress => 1001,
            Self::ConfigInvalid(_) | Self::Internal(_) => 1011,
        }
    }

    /// HTTP status code to return for a pre-upgrade rejection, if this
    /// error applies before the WebSocket handshake completes.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::RateLimited(_) => 429,
            _ => 503,
        }
    }
}

/// Classified reasons a connection's pumps may terminate, used in the
/// structured disconnect log (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// readPump hit a socket read error.
    ReadError,
    /// writePump hit a socket write error.
    WriteError,
    /// The client sent a malformed or out-of-contract message.
    ProtocolViolation,
    /// The client closed the connection.
    ClientClose,
    /// Server-initiated eviction: a CRITICAL envelope could not be
    /// delivered within the bounded wait.
    SlowClientCritical,
    /// The process is shutting down.
    ServerShutdown,
    /// The shard hosting this connection was killed (multi mode).
    BackendUnavailable,
}

impl DisconnectReason {
    /// Human-readable tag used in structured logs and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadError => "read_error",
            Self::WriteError => "write_error",
            Self::ProtocolViolation => "protocol_violation",
            Self::ClientClose => "client_close",
            Self::SlowClientCritical => "slow_client_critical",
            Self::ServerShutdown => "server_shutdown",
            Self::BackendUnavailable => "backend_unavailable",
        }
    }
}
