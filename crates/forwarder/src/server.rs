//! HTTP control plane
//!
//! Thin axum layer over the engines and their registries. Every route is
//! scoped by instance name (`adsb`, `ais`); an unknown instance is a 404.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use marlink_metadata::{FilterPolicy, MetadataError, NewEndpoint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::engine::ForwardingEngine;
use crate::error::EngineError;
use crate::metrics;

const DEFAULT_LOG_COUNT: usize = 100;

/// Engines keyed by instance name, shared with every handler
#[derive(Clone)]
pub struct ControlPlane {
    engines: Arc<BTreeMap<String, Arc<ForwardingEngine>>>,
}

impl ControlPlane {
    pub fn new(engines: impl IntoIterator<Item = Arc<ForwardingEngine>>) -> Self {
        let engines = engines
            .into_iter()
            .map(|engine| (engine.name().to_string(), engine))
            .collect();
        Self {
            engines: Arc::new(engines),
        }
    }

    pub fn engine(&self, instance: &str) -> Option<&Arc<ForwardingEngine>> {
        self.engines.get(instance)
    }

    pub fn engines(&self) -> impl Iterator<Item = &Arc<ForwardingEngine>> {
        self.engines.values()
    }

    /// Stop every running engine, used on process shutdown
    pub async fn stop_all(&self) {
        for engine in self.engines.values() {
            match engine.stop().await {
                Ok(()) | Err(EngineError::NotRunning) => {}
                Err(e) => warn!(instance = %engine.name(), error = %e, "Failed to stop engine"),
            }
        }
    }

    fn lookup(&self, instance: &str) -> Result<Arc<ForwardingEngine>, ApiError> {
        self.engine(instance)
            .cloned()
            .ok_or_else(|| ApiError::UnknownInstance(instance.to_string()))
    }
}

/// `{success, message}` body used by every mutating route
#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

#[derive(Debug)]
pub enum ApiError {
    UnknownInstance(String),
    Engine(EngineError),
    Metadata(MetadataError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<MetadataError> for ApiError {
    fn from(e: MetadataError) -> Self {
        ApiError::Metadata(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::UnknownInstance(name) => {
                (StatusCode::NOT_FOUND, format!("unknown instance: {}", name))
            }
            ApiError::Engine(e) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::Metadata(MetadataError::NotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("endpoint not found: {}", id))
            }
            ApiError::Metadata(e @ MetadataError::Validation(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            ApiError::Metadata(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (
            status,
            Json(ActionResponse {
                success: false,
                message,
            }),
        )
            .into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    instances: BTreeMap<String, bool>,
}

async fn health(State(plane): State<ControlPlane>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        instances: plane
            .engines()
            .map(|engine| (engine.name().to_string(), engine.is_running()))
            .collect(),
    })
}

async fn status(
    State(plane): State<ControlPlane>,
    Path(instance): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(plane.lookup(&instance)?.status()))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub count: Option<usize>,
}

async fn logs(
    State(plane): State<ControlPlane>,
    Path(instance): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = plane.lookup(&instance)?;
    Ok(Json(engine.logs(query.count.unwrap_or(DEFAULT_LOG_COUNT))))
}

async fn start(
    State(plane): State<ControlPlane>,
    Path(instance): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = plane.lookup(&instance)?;
    engine.start().await?;
    Ok(ActionResponse::ok(format!("{} service started", engine.name())))
}

async fn stop(
    State(plane): State<ControlPlane>,
    Path(instance): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = plane.lookup(&instance)?;
    engine.stop().await?;
    Ok(ActionResponse::ok(format!("{} service stopped", engine.name())))
}

async fn restart(
    State(plane): State<ControlPlane>,
    Path(instance): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = plane.lookup(&instance)?;
    engine.restart().await?;
    Ok(ActionResponse::ok(format!("{} service restarted", engine.name())))
}

async fn list_endpoints(
    State(plane): State<ControlPlane>,
    Path(instance): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(plane.lookup(&instance)?.registry().list()))
}

async fn add_endpoint(
    State(plane): State<ControlPlane>,
    Path(instance): Path<String>,
    Json(new): Json<NewEndpoint>,
) -> Result<impl IntoResponse, ApiError> {
    let endpoint = plane.lookup(&instance)?.registry().add(new)?;
    Ok((StatusCode::CREATED, Json(endpoint)))
}

async fn update_endpoint(
    State(plane): State<ControlPlane>,
    Path((instance, id)): Path<(String, String)>,
    Json(new): Json<NewEndpoint>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(plane.lookup(&instance)?.registry().update(&id, new)?))
}

async fn delete_endpoint(
    State(plane): State<ControlPlane>,
    Path((instance, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = plane.lookup(&instance)?.registry().delete(&id)?;
    Ok(ActionResponse::ok(format!("Endpoint {} deleted", removed.id)))
}

async fn toggle_endpoint(
    State(plane): State<ControlPlane>,
    Path((instance, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(plane.lookup(&instance)?.registry().toggle(&id)?))
}

async fn set_filter(
    State(plane): State<ControlPlane>,
    Path(instance): Path<String>,
    Json(policy): Json<FilterPolicy>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(plane.lookup(&instance)?.registry().set_filter(policy)?))
}

async fn prometheus_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding error: {}", e),
        )
            .into_response(),
    }
}

/// Build the control plane router
pub fn create_router(plane: ControlPlane) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/api/:instance/status", get(status))
        .route("/api/:instance/logs", get(logs))
        .route("/api/:instance/start", post(start))
        .route("/api/:instance/stop", post(stop))
        .route("/api/:instance/restart", post(restart))
        .route(
            "/api/:instance/endpoints",
            get(list_endpoints).post(add_endpoint),
        )
        .route(
            "/api/:instance/endpoints/:id",
            put(update_endpoint).delete(delete_endpoint),
        )
        .route("/api/:instance/endpoints/:id/toggle", post(toggle_endpoint))
        .route("/api/:instance/filter", put(set_filter))
        .with_state(plane)
}

/// Serve the control plane until `shutdown` resolves
pub async fn run_server(
    addr: SocketAddr,
    plane: ControlPlane,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = create_router(plane);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Control plane listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
