//! API server: HTTP routes over the journey engine plus the metrics exporter.

use crate::rest::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use courier_core::config::AppConfig;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Builds the REST router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Journey entry and lifecycle
        .route("/v1/journeys/:id", get(rest::get_journey))
        .route("/v1/journeys/:id/admit", post(rest::admit))
        .route("/v1/journeys/:id/resume", post(rest::resume))
        .route("/v1/journeys/:id/pause", post(rest::pause))
        .route("/v1/journeys/:id/unpause", post(rest::unpause))
        .route("/v1/journeys/:id/stop", post(rest::stop))
        .route(
            "/v1/journeys/:id/locations/:customer_id",
            get(rest::get_location),
        )
        .route("/v1/queues", get(rest::queues))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP front door of a courier node.
pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serve the REST API until `shutdown` resolves.
    pub async fn start_http(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let app = router(self.state.clone());

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
