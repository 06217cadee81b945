//! Logger initialization (§6), matching `crates/audit/src/bin/main.rs`'s
//! `tracing_subscriber::registry()` pattern but branching on
//! [`LogFormat`] for the pack's json/text split instead of always using
//! `fmt::layer()`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use ws_core::{Config, LogFormat};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides
/// `config.log_level` when set, matching the audit archiver's fallback.
pub fn init(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
