//! REST handlers for journey admission, lifecycle control and health checks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use courier_core::types::{Customer, Journey, JourneyLocation, TriggerEvent};
use courier_core::CourierError;
use courier_delivery::rate_limit::RateUsage;
use courier_journey::queue::{FinishedJob, QueueStats};
use courier_journey::{JourneyEngine, QueueFabric, Ticket};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

/// Maximum customer id length accepted at the boundary.
const MAX_CUSTOMER_ID_LEN: usize = 256;

/// Default and upper bound for the finished-jobs listing.
const DEFAULT_RECENT: usize = 20;
const MAX_RECENT: usize = 500;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: JourneyEngine,
    pub fabric: Arc<QueueFabric>,
    pub node_id: String,
    pub start_time: Instant,
    /// Flipped once the worker pool is consuming.
    pub ready: Arc<AtomicBool>,
}

/// Body of `admit` and `resume`.
#[derive(Debug, Deserialize)]
pub struct EntryRequest {
    pub customer: Customer,
    pub step_id: Uuid,
    #[serde(default)]
    pub event: Option<TriggerEvent>,
}

#[derive(Debug, Serialize)]
pub struct JourneyView {
    pub journey: Journey,
    pub usage: RateUsage,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct QueuesResponse {
    pub node_id: String,
    pub stats: Vec<QueueStats>,
    pub recent: Vec<FinishedJob>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

/// Engine error mapped onto an HTTP status.
#[derive(Debug)]
pub struct ApiError(CourierError);

impl From<CourierError> for ApiError {
    fn from(e: CourierError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            CourierError::JourneyNotFound(_) => (StatusCode::NOT_FOUND, "journey_not_found"),
            CourierError::MissingStep(_) => (StatusCode::NOT_FOUND, "step_not_found"),
            CourierError::MissingTemplate(_) => (StatusCode::NOT_FOUND, "template_not_found"),
            CourierError::AdmissionRefused { .. } => (StatusCode::CONFLICT, "admission_refused"),
            CourierError::AlreadyInJourney { .. } => (StatusCode::CONFLICT, "already_in_journey"),
            CourierError::NotAtStep { .. } => (StatusCode::CONFLICT, "not_at_step"),
            CourierError::Store(_) | CourierError::Queue(_) | CourierError::Delivery(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable")
            }
            CourierError::NotImplemented(_)
            | CourierError::Config(_)
            | CourierError::Serialization(_)
            | CourierError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = if status.is_server_error() {
            error!(error = %self.0, "Request failed");
            metrics::counter!("api.errors").increment(1);
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                "Internal processing error".to_string()
            } else {
                self.0.to_string()
            }
        } else {
            self.0.to_string()
        };
        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

fn validate_entry(request: &EntryRequest) -> Result<(), &'static str> {
    if request.customer.id.is_empty() {
        return Err("customer 'id' must not be empty");
    }
    if request.customer.id.len() > MAX_CUSTOMER_ID_LEN {
        return Err("customer 'id' exceeds maximum length");
    }
    Ok(())
}

fn reject(msg: &'static str) -> Response {
    metrics::counter!("api.validation_errors").increment(1);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "invalid_request".to_string(),
            message: msg.to_string(),
        }),
    )
        .into_response()
}

/// POST /v1/journeys/:id/admit: Place a customer at a start step.
pub async fn admit(
    State(state): State<AppState>,
    Path(journey_id): Path<Uuid>,
    Json(request): Json<EntryRequest>,
) -> Response {
    if let Err(msg) = validate_entry(&request) {
        warn!(journey_id = %journey_id, error = msg, "Admit request validation failed");
        return reject(msg);
    }
    metrics::counter!("api.requests", "route" => "admit").increment(1);
    match state
        .engine
        .admit(request.customer, journey_id, request.step_id, request.event)
        .await
    {
        Ok(ticket) => accepted(ticket),
        Err(e) => ApiError(e).into_response(),
    }
}

/// POST /v1/journeys/:id/resume: Re-enter a customer resting at a step.
pub async fn resume(
    State(state): State<AppState>,
    Path(journey_id): Path<Uuid>,
    Json(request): Json<EntryRequest>,
) -> Response {
    if let Err(msg) = validate_entry(&request) {
        warn!(journey_id = %journey_id, error = msg, "Resume request validation failed");
        return reject(msg);
    }
    metrics::counter!("api.requests", "route" => "resume").increment(1);
    match state
        .engine
        .resume(request.customer, journey_id, request.step_id, request.event)
        .await
    {
        Ok(ticket) => accepted(ticket),
        Err(e) => ApiError(e).into_response(),
    }
}

fn accepted(ticket: Ticket) -> Response {
    (StatusCode::ACCEPTED, Json(ticket)).into_response()
}

/// POST /v1/journeys/:id/pause
pub async fn pause(
    State(state): State<AppState>,
    Path(journey_id): Path<Uuid>,
) -> Result<Json<Journey>, ApiError> {
    Ok(Json(state.engine.pause(journey_id)?))
}

/// POST /v1/journeys/:id/unpause
pub async fn unpause(
    State(state): State<AppState>,
    Path(journey_id): Path<Uuid>,
) -> Result<Json<Journey>, ApiError> {
    Ok(Json(state.engine.unpause(journey_id)?))
}

/// POST /v1/journeys/:id/stop: Stop the journey; in-flight jobs exit their customers.
pub async fn stop(
    State(state): State<AppState>,
    Path(journey_id): Path<Uuid>,
) -> Result<Json<Journey>, ApiError> {
    Ok(Json(state.engine.stop(journey_id)?))
}

/// GET /v1/journeys/:id: Journey definition with its current rate counters.
pub async fn get_journey(
    State(state): State<AppState>,
    Path(journey_id): Path<Uuid>,
) -> Result<Json<JourneyView>, ApiError> {
    let journey = state
        .engine
        .registry()
        .get(journey_id)
        .ok_or(CourierError::JourneyNotFound(journey_id))?;
    let usage = state.engine.usage(journey_id).await?;
    Ok(Json(JourneyView { journey, usage }))
}

/// GET /v1/journeys/:id/locations/:customer_id
pub async fn get_location(
    State(state): State<AppState>,
    Path((journey_id, customer_id)): Path<(Uuid, String)>,
) -> Result<Json<JourneyLocation>, Response> {
    match state.engine.location(&customer_id, journey_id).await {
        Ok(Some(location)) => Ok(Json(location)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "location_not_found".to_string(),
                message: format!("Customer {customer_id} is not in journey {journey_id}"),
            }),
        )
            .into_response()),
        Err(e) => Err(ApiError(e).into_response()),
    }
}

/// GET /v1/queues: Per-queue counters and recently finished jobs.
pub async fn queues(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Json<QueuesResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT).min(MAX_RECENT);
    Json(QueuesResponse {
        node_id: state.node_id.clone(),
        stats: state.fabric.stats(),
        recent: state.fabric.recent(limit),
    })
}

/// GET /health: Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready: Readiness check for Kubernetes.
/// Returns 200 only once the worker pool is draining the queues.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.ready.load(Ordering::Acquire) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /live: Liveness check for Kubernetes.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
