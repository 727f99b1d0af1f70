//! Admin/metrics HTTP surface: `/health`, `/metrics` (Prometheus text), and
//! `/metrics.json`, plus Swagger UI over an `OpenApi`-derived spec. Grounded
//! on the teacher's `server/stats.rs` (the `ApiDoc`/`SwaggerUi` wiring, the
//! `StatsState`/`build_router`/`start_*_server` shape) and
//! `api/handlers/management.rs` (the hand-built Prometheus `# HELP`/`# TYPE`
//! text, delegated here to [`crate::monitor::PerformanceMonitor`]).

use crate::monitor::PerformanceMonitor;
use crate::pool::ConnectionPool;
use crate::utils::error::Result;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

#[derive(Clone)]
pub struct ApiState {
    monitor: Arc<PerformanceMonitor>,
    pool: Arc<ConnectionPool>,
    started_at: Instant,
}

impl ApiState {
    pub fn new(monitor: Arc<PerformanceMonitor>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            monitor,
            pool,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PoolStatusResponse {
    active_connections: usize,
    idle_connections: usize,
    queued_waiters: usize,
    total_created: u64,
    total_reused: u64,
    total_rejected: u64,
    at_capacity: bool,
}

/// Bind a listener and serve the admin surface in a background task.
pub async fn start_admin_server(
    bind_addr: &str,
    monitor: Arc<PerformanceMonitor>,
    pool: Arc<ConnectionPool>,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(bind_addr).await?;
    let local_addr = listener.local_addr()?;

    let state = ApiState::new(monitor, pool);
    let router = build_router(state);

    info!("admin/metrics API listening on {}", local_addr);

    let server = axum::serve(listener, router.into_make_service());
    let handle = tokio::spawn(async move {
        if let Err(err) = server.await {
            error!("admin API error: {}", err);
        }
    });

    Ok(handle)
}

#[derive(OpenApi)]
#[openapi(
    paths(health_check, pool_status, metrics_json),
    components(schemas(HealthResponse, PoolStatusResponse))
)]
struct ApiDoc;

pub fn build_router(state: ApiState) -> Router {
    let mut openapi = ApiDoc::openapi();
    openapi.info.title = "httpcore admin API".into();
    openapi.info.version = env!("CARGO_PKG_VERSION").into();
    openapi.info.description =
        Some("Health, pool status, and metrics exposition for the httpcore serving substrate".into());

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/openapi.json", openapi))
        .route("/health", get(health_check))
        .route("/pool", get(pool_status))
        .route("/metrics", get(metrics_prometheus))
        .route("/metrics.json", get(metrics_json))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Server is healthy", body = HealthResponse)),
    tag = "Health"
)]
async fn health_check(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    };
    (StatusCode::OK, Json(response))
}

#[utoipa::path(
    get,
    path = "/pool",
    responses((status = 200, description = "Connection pool occupancy and lifetime counters", body = PoolStatusResponse)),
    tag = "Pool"
)]
async fn pool_status(State(state): State<ApiState>) -> (StatusCode, Json<PoolStatusResponse>) {
    let response = PoolStatusResponse {
        active_connections: state.pool.active_count().await,
        idle_connections: state.pool.idle_count().await,
        queued_waiters: state.pool.queue_size().await,
        total_created: state.pool.total_created(),
        total_reused: state.pool.reuse_count(),
        total_rejected: state.pool.rejected_count(),
        at_capacity: state.pool.is_at_capacity().await,
    };
    (StatusCode::OK, Json(response))
}

/// Prometheus text exposition, built entirely by
/// [`PerformanceMonitor::export_prometheus`] so the metric names/types match
/// the spec byte-for-byte.
async fn metrics_prometheus(State(state): State<ApiState>) -> (StatusCode, String) {
    (StatusCode::OK, state.monitor.export_prometheus())
}

#[utoipa::path(
    get,
    path = "/metrics.json",
    responses((status = 200, description = "JSON snapshot of request/connection counters and percentiles")),
    tag = "Metrics"
)]
async fn metrics_json(State(state): State<ApiState>) -> (StatusCode, String) {
    (StatusCode::OK, state.monitor.export_json())
}
