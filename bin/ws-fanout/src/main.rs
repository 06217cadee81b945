//! Lifecycle glue: config → logger → `ResourceGuard` → Kafka → shards →
//! load balancer (multi only) → admin routes → signal handler → graceful
//! shutdown (§4.9).

mod admin;
mod logging;

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ws_core::{Config, ConnectionAdmission, Mode};
use ws_kafka::RecordStream;
use ws_metrics::{HealthThresholds, SlowClientTracker};
use ws_resource_guard::{GuardConfig, ResourceGuard};
use ws_shard::Shard;

/// Cadence of the buffer/memory/goroutine sampler (§5's "one buffer
/// sampler, one memory sampler" internal timers, consolidated into a
/// single periodic task).
const SAMPLER_INTERVAL: Duration = Duration::from_secs(1);

/// Small fixed consumer pool used in multi mode (§4.3: "2-3 consumers
/// sharing one group").
const MULTI_MODE_KAFKA_POOL_SIZE: usize = 3;
/// Decoded-record channel capacity between the Kafka engine and the
/// per-shard broadcast fan-out.
const KAFKA_SINK_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::parse();

    logging::init(&config);
    config
        .validate()
        .map_err(|err| anyhow::anyhow!("invalid configuration: {err}"))?;

    info!(
        mode = ?config.mode,
        addr = %config.addr,
        num_shards = config.num_shards,
        kafka_brokers = %config.kafka_brokers,
        "starting ws-fanout"
    );

    let shutdown = CancellationToken::new();
    let metrics = ws_metrics::Metrics::default();
    ws_metrics::init_prometheus_exporter(
        config
            .metrics_addr
            .parse()
            .context("METRICS_ADDR already validated but failed to parse")?,
    )
    .context("failed to install Prometheus exporter")?;

    let process_guard = Arc::new(ResourceGuard::new(GuardConfig {
        cpu_reject_threshold: config.cpu_reject_threshold,
        cpu_pause_threshold: config.cpu_pause_threshold,
        memory_limit_bytes: config.memory_limit_bytes,
        max_connections: config.max_connections,
        max_goroutines: config.max_goroutines,
        per_ip_connection_rate: config.per_ip_connection_rate,
        max_kafka_rate: config.max_kafka_rate,
        max_broadcast_rate: config.max_broadcast_rate,
    }));
    process_guard.spawn_sampler(ws_platform::discover_cpu_source(), shutdown.clone());

    let kafka_connected = Arc::new(AtomicBool::new(false));
    let slow_client_tracker = Arc::new(SlowClientTracker::new());

    let shards = build_shards(&config, &process_guard, &metrics, &slow_client_tracker, &shutdown)?;

    spawn_buffer_sampler(
        shards.clone(),
        metrics.clone(),
        Arc::clone(&process_guard),
        shutdown.clone(),
    );

    spawn_kafka_pipeline(
        &config,
        Arc::clone(&process_guard) as Arc<dyn ws_core::KafkaAdmission>,
        shards.clone(),
        Arc::clone(&kafka_connected),
        shutdown.clone(),
    )?;

    let admin_state = admin::AdminState {
        resource_guard: Arc::clone(&process_guard),
        kafka_connected,
        slow_client_tracker,
        thresholds: HealthThresholds::default(),
        metrics: metrics.clone(),
    };

    let mut servers = Vec::new();

    for shard in &shards {
        let mut router = shard.router();
        if shards.len() == 1 && config.mode == Mode::Single {
            router = router.merge(admin::router(admin_state.clone(), config.enable_pprof));
        }
        servers.push(spawn_server(shard.bind_addr, router, shutdown.clone()));
    }

    if config.mode == Mode::Multi {
        let balancer = Arc::new(ws_balancer::LoadBalancer::new(
            shards.clone(),
            Arc::clone(&process_guard) as Arc<dyn ConnectionAdmission>,
            shutdown.clone(),
        ));
        let public_addr: SocketAddr = config
            .addr
            .parse()
            .context("WS_ADDR already validated but failed to parse")?;
        let router = balancer
            .router()
            .merge(admin::router(admin_state, config.enable_pprof));
        servers.push(spawn_server(public_addr, router, shutdown.clone()));
    }

    spawn_signal_handler(shutdown.clone());

    for server in servers {
        if let Err(err) = server.await {
            error!(error = %err, "server task panicked");
        }
    }

    info!("ws-fanout shut down cleanly");
    Ok(())
}

/// Build one `Shard` in single mode (bound to the public address, sharing
/// the process-wide `ResourceGuard`) or `config.num_shards` shards in
/// multi mode (each bound to its own loopback port with its own
/// connection-only admission, per-shard `max_connections`) — the dual
/// admission design recorded in DESIGN.md.
fn build_shards(
    config: &Config,
    process_guard: &Arc<ResourceGuard>,
    metrics: &ws_metrics::Metrics,
    slow_client_tracker: &Arc<SlowClientTracker>,
    shutdown: &CancellationToken,
) -> anyhow::Result<Vec<Arc<Shard>>> {
    match config.mode {
        Mode::Single => {
            let bind_addr: SocketAddr = config
                .addr
                .parse()
                .context("WS_ADDR already validated but failed to parse")?;
            Ok(vec![Arc::new(Shard::new(
                0,
                bind_addr,
                Arc::clone(process_guard) as Arc<dyn ConnectionAdmission>,
                config.outbound_queue_size,
                config.kafka_brokers.clone(),
                metrics.clone(),
                Arc::clone(slow_client_tracker),
                shutdown.clone(),
                num_cpus::get(),
            ))])
        }
        Mode::Multi => {
            let mut shards = Vec::with_capacity(config.num_shards);
            for index in 0..config.num_shards {
                let (ip, port) = config.shard_bind_addr(index);
                let bind_addr = SocketAddr::new(ip, port);

                // CPU/memory pressure is already gated by the balancer's
                // process-wide `process_guard` before a shard is ever
                // dialed, so this scoped guard disables its own
                // cpu/memory rejection (thresholds at 100%) and exists
                // only to cap per-shard connection and task counts.
                let shard_guard = Arc::new(ResourceGuard::new(GuardConfig {
                    cpu_reject_threshold: 100.0,
                    cpu_pause_threshold: 100.0,
                    memory_limit_bytes: u64::MAX,
                    max_connections: config.max_connections,
                    max_goroutines: config.max_goroutines,
                    per_ip_connection_rate: config.per_ip_connection_rate,
                    max_kafka_rate: config.max_kafka_rate,
                    max_broadcast_rate: config.max_broadcast_rate,
                }));

                shards.push(Arc::new(Shard::new(
                    index,
                    bind_addr,
                    shard_guard as Arc<dyn ConnectionAdmission>,
                    config.outbound_queue_size,
                    config.kafka_brokers.clone(),
                    metrics.clone(),
                    Arc::clone(slow_client_tracker),
                    shutdown.clone(),
                    num_cpus::get(),
                )));
            }
            Ok(shards)
        }
    }
}

/// Wire the Kafka consumer(s) to every shard's `BroadcastBus` (§4.3 step
/// 4): every shard needs every record because the `LoadBalancer` can
/// route any client to any shard.
fn spawn_kafka_pipeline(
    config: &Config,
    admission: Arc<dyn ws_core::KafkaAdmission>,
    shards: Vec<Arc<Shard>>,
    kafka_connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel(KAFKA_SINK_CAPACITY);

    match config.mode {
        Mode::Single => {
            let consumer = ws_kafka::RdKafkaConsumer::new(
                &config.kafka_brokers,
                &config.kafka_group_id,
                &config.kafka_topics,
            )
            .context("failed to build Kafka consumer")?;
            let stream: Arc<dyn RecordStream> = Arc::new(consumer);
            kafka_connected.store(true, Ordering::Relaxed);
            tokio::spawn(ws_kafka::run_consumer_loop(
                stream,
                admission,
                tx,
                shutdown.clone(),
            ));
        }
        Mode::Multi => {
            let mut streams: Vec<Arc<dyn RecordStream>> =
                Vec::with_capacity(MULTI_MODE_KAFKA_POOL_SIZE);
            for _ in 0..MULTI_MODE_KAFKA_POOL_SIZE {
                let consumer = ws_kafka::RdKafkaConsumer::new(
                    &config.kafka_brokers,
                    &config.kafka_group_id,
                    &config.kafka_topics,
                )
                .context("failed to build Kafka consumer")?;
                streams.push(Arc::new(consumer));
            }
            kafka_connected.store(true, Ordering::Relaxed);
            ws_kafka::spawn_consumer_pool(streams, admission, tx, shutdown.clone());
        }
    }

    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            for shard in &shards {
                shard.broadcast().publish(&record).await;
            }
        }
        warn!("Kafka decode sink closed, broadcast dispatcher exiting");
    });

    Ok(())
}

/// Periodically refresh the gauges that aren't cheap atomic reads off the
/// hot path: resident memory, live task count, CPU%, and per-shard
/// outbound queue depth/utilization (§5, §6's `/metrics` family list).
fn spawn_buffer_sampler(
    shards: Vec<Arc<Shard>>,
    metrics: ws_metrics::Metrics,
    process_guard: Arc<ResourceGuard>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SAMPLER_INTERVAL);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            metrics.memory_bytes.set(ws_platform::current_rss_bytes() as f64);
            metrics.goroutines_active.set(process_guard.task_count() as f64);
            metrics.cpu_usage_percent.set(process_guard.cpu_percent());

            for shard in &shards {
                shard.sample_queue_depths();
            }
        }
    });
}

fn spawn_server(
    addr: SocketAddr,
    router: axum::Router,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(%addr, error = %err, "failed to bind listener");
                return;
            }
        };
        info!(%addr, "listening");

        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await;

        if let Err(err) = result {
            error!(%addr, error = %err, "server exited with error");
        }
    })
}

/// Trigger graceful shutdown on SIGTERM (containers) or SIGINT (Ctrl-C
/// locally), matching `shadow-boost`'s `ctrl_c`-driven stop but extended
/// with `SIGTERM` since production deployments send that, not SIGINT
/// (§4.9).
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    error!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                result = tokio::signal::ctrl_c() => {
                    if let Err(err) = result {
                        error!(error = %err, "failed to listen for ctrl-c");
                    } else {
                        info!("received SIGINT");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for ctrl-c");
                return;
            }
            info!("received ctrl-c");
        }

        shutdown.cancel();
    });
}
