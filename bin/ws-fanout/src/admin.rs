//! `/health` (and, when enabled, `/debug/pprof/*`) routes mounted on the
//! public router (§4.8, §6).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use ws_metrics::{HealthInputs, HealthReport, HealthThresholds, SlowClientTracker};
use ws_resource_guard::ResourceGuard;

/// Shared state the admin routes read from; cheap to clone (all fields
/// are `Arc`s).
#[derive(Clone)]
pub struct AdminState {
    pub resource_guard: Arc<ResourceGuard>,
    pub kafka_connected: Arc<AtomicBool>,
    pub slow_client_tracker: Arc<SlowClientTracker>,
    pub thresholds: HealthThresholds,
    pub metrics: ws_metrics::Metrics,
}

/// Build the admin router. `enable_pprof` gates `/debug/pprof/flamegraph`
/// at runtime even when the crate was compiled with the `pprof-admin`
/// feature (§6).
#[must_use]
pub fn router(state: AdminState, enable_pprof: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .with_state(state);

    if enable_pprof {
        router.merge(pprof_router())
    } else {
        router
    }
}

async fn health_handler(State(state): State<AdminState>) -> Response {
    let guard = &state.resource_guard;
    let inputs = HealthInputs {
        kafka_connected: state.kafka_connected.load(Ordering::Relaxed),
        capacity_percent: guard.capacity_percent(),
        cpu_percent: guard.cpu_percent(),
        memory_percent: guard.memory_ratio() * 100.0,
        goroutines_percent: guard.goroutines_percent(),
        slow_client_rate: state.slow_client_tracker.rate(),
    };
    let report = HealthReport::aggregate(inputs, state.thresholds);

    state
        .metrics
        .kafka_connected
        .set(if inputs.kafka_connected { 1.0 } else { 0.0 });
    state.metrics.cpu_usage_percent.set(inputs.cpu_percent);

    let status = StatusCode::from_u16(report.status.http_status())
        .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    (status, Json(report)).into_response()
}

#[cfg(feature = "pprof-admin")]
fn pprof_router() -> Router {
    Router::new().route("/debug/pprof/flamegraph", get(flamegraph_handler))
}

#[cfg(not(feature = "pprof-admin"))]
fn pprof_router() -> Router {
    Router::new()
}

/// Sample CPU for 10s and render a flamegraph SVG, mirroring the common
/// `pprof`-crate + axum integration (enrichment from `other_examples`:
/// `clockworklabs-SpacetimeDB` carries `pprof` in its dependency graph,
/// but ships no route wiring to copy, so this handler follows `pprof`'s
/// own documented `ProfilerGuardBuilder` API instead).
#[cfg(feature = "pprof-admin")]
async fn flamegraph_handler() -> Response {
    let guard = match pprof::ProfilerGuardBuilder::default()
        .frequency(100)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()
    {
        Ok(guard) => guard,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to start profiler: {err}"),
            )
                .into_response();
        }
    };

    tokio::time::sleep(std::time::Duration::from_secs(10)).await;

    let report = match guard.report().build() {
        Ok(report) => report,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to build profile report: {err}"),
            )
                .into_response();
        }
    };

    let mut body = Vec::new();
    if let Err(err) = report.flamegraph(&mut body) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to render flamegraph: {err}"),
        )
            .into_response();
    }

    ([(axum::http::header::CONTENT_TYPE, "image/svg+xml")], body).into_response()
}
