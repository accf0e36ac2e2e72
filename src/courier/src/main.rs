//! Courier: journey step-advancement engine.
//!
//! Main entry point that wires the stores, the queue fabric and the worker
//! pool, then serves the HTTP API until ctrl-c.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use courier_api::{ApiServer, AppState};
use courier_cache::{CachedCatalog, RedisClient, RedisLocationStore, RedisRateLimitStore};
use courier_core::clock::SystemClock;
use courier_core::config::AppConfig;
use courier_core::contracts::{LocationStore, RateLimitStore};
use courier_core::event_bus::TracingSink;
use courier_delivery::{InMemoryRateLimitStore, RateLimiter, SendGate, TemplateRenderer};
use courier_journey::demo::seed_demo_journey;
use courier_journey::{
    EngineContext, InMemoryCatalog, InMemoryLocationStore, JourneyEngine, JourneyRegistry,
    LocationTracker, LoggingSender, QueueFabric, WorkerPool,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Journey step-advancement engine")]
#[command(version)]
struct Cli {
    /// Optional TOML config file
    #[arg(long, short, env = "COURIER_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "COURIER__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "COURIER__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Metrics port (overrides config)
    #[arg(long, env = "COURIER__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Seed a demo journey into the in-memory catalog
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Courier starting up");

    // Load configuration
    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        metrics_port = config.metrics.port,
        redis = config.redis.enabled,
        mock_send = config.engine.mock_send,
        "Configuration loaded"
    );

    // Counter and location stores
    let (counters, locations): (Arc<dyn RateLimitStore>, Arc<dyn LocationStore>) =
        if config.redis.enabled {
            let client = RedisClient::connect(&config.redis).await?;
            (
                Arc::new(RedisRateLimitStore::new(client.clone())),
                Arc::new(RedisLocationStore::new(client)),
            )
        } else {
            info!("Redis disabled, using in-memory counter and location stores");
            (
                Arc::new(InMemoryRateLimitStore::new()),
                Arc::new(InMemoryLocationStore::new()),
            )
        };

    // Catalog and journey registry
    let store = Arc::new(InMemoryCatalog::new());
    let journeys = Arc::new(JourneyRegistry::new());
    if cli.seed_demo {
        let demo = seed_demo_journey(&store, &journeys);
        info!(
            journey_id = %demo.journey_id,
            start_step = %demo.start_step,
            "Demo journey seeded"
        );
    }
    let catalog = Arc::new(CachedCatalog::new(
        store.clone(),
        store,
        Duration::from_secs(config.engine.catalog_cache_ttl_secs),
        config.engine.catalog_cache_max_entries,
    ));

    let fabric = Arc::new(QueueFabric::new(config.queues.completed_retention));
    let ctx = EngineContext {
        steps: catalog.clone(),
        templates: catalog.clone(),
        locations: LocationTracker::new(
            locations,
            chrono::Duration::seconds(config.engine.lock_max_hold_secs as i64),
        ),
        queue: fabric.clone(),
        sender: Arc::new(LoggingSender),
        telemetry: Arc::new(TracingSink),
        gate: SendGate::new(RateLimiter::new(counters), config.engine.mock_send),
        journeys,
        clock: Arc::new(SystemClock),
        renderer: TemplateRenderer::new(),
        mock_ping_url: config.engine.mock_ping_url.clone(),
    };
    let engine = JourneyEngine::new(ctx);

    // Start queue consumers
    let mut pool = WorkerPool::new(fabric.clone(), engine.dispatcher(), config.queues.clone());
    pool.start();
    let ready = Arc::new(AtomicBool::new(false));
    ready.store(pool.consumer_count() > 0, Ordering::Release);

    let api_server = ApiServer::new(
        config.clone(),
        AppState {
            engine,
            fabric,
            node_id: config.node_id.clone(),
            start_time: Instant::now(),
            ready: ready.clone(),
        },
    );

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    // Spawn catalog cache maintenance task
    let catalog_for_maintenance = catalog.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            catalog_for_maintenance.maintenance();
        }
    });

    info!("Courier is ready to serve traffic");

    // Serve HTTP until ctrl-c
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        ready.store(false, Ordering::Release);
        info!("Shutdown signal received");
    };
    let served = api_server.start_http(shutdown).await;

    pool.shutdown();
    served
}
