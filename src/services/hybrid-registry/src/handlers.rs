//! API Handlers Module
//!
//! Admin HTTP API of the hybrid registry: registration, connection method
//! changes, status reports and cache maintenance.

use crate::config::HybridRegistryConfig;
use crate::health::{HealthMonitor, HealthMonitoringStats, HealthReport};
use crate::models::{
    CacheStats, ConnectionMethod, MethodChange, RegisterServiceRequest, RegistrationReceipt,
    ServiceStatusReport, ServiceSummary, UpdateConnectionMethodRequest,
};
use crate::registry::{RegistryComponents, ServiceRegistry};
use crate::{ErrorKind, RegistryError};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HybridRegistryConfig>,
    pub registry: Arc<dyn ServiceRegistry>,
    pub health_monitor: Arc<HealthMonitor>,
}

impl AppState {
    pub fn from_components(components: &RegistryComponents) -> Self {
        Self {
            config: Arc::clone(&components.config),
            registry: Arc::clone(&components.registry) as Arc<dyn ServiceRegistry>,
            health_monitor: Arc::clone(&components.health),
        }
    }
}

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            error_kind: None,
            timestamp: chrono::Utc::now(),
        }
    }

    fn from_error(error: &RegistryError) -> Self {
        let mut response = Self::error(error.to_string());
        response.error_kind = Some(error.kind().as_str().to_string());
        response
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub monitored_instances: u64,
}

/// Cache invalidation response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationResponse {
    pub removed_keys: u64,
}

type ApiError = (StatusCode, Json<ApiResponse<()>>);
type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// HTTP status for each error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::DuplicateInstance => StatusCode::CONFLICT,
        ErrorKind::ServiceNotFound => StatusCode::NOT_FOUND,
        ErrorKind::ServiceDisabled => StatusCode::CONFLICT,
        ErrorKind::NoHealthyInstances
        | ErrorKind::ServiceUnavailable
        | ErrorKind::CacheConnection
        | ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Config | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(error: RegistryError) -> ApiError {
    let status = status_for(error.kind());
    if status.is_server_error() {
        error!("Request failed: {}", error);
    } else {
        debug!("Request rejected: {}", error);
    }
    (status, Json(ApiResponse::from_error(&error)))
}

/// Create the main router with all API routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Service management routes
        .route("/api/v1/services", get(list_services))
        .route("/api/v1/services", post(register_service))
        .route("/api/v1/services/:name", delete(deregister_service))
        .route("/api/v1/services/:name/status", get(get_service_status))
        .route(
            "/api/v1/services/:name/connection-method",
            put(update_connection_method),
        )
        .route(
            "/api/v1/services/:name/instances/:id",
            delete(deregister_instance),
        )
        .route(
            "/api/v1/services/:name/instances/:id/check",
            post(check_instance),
        )
        .route(
            "/api/v1/services/:name/instances/:id/report",
            post(report_instance_health),
        )
        // Cache routes
        .route("/api/v1/cache/stats", get(get_cache_stats))
        .route("/api/v1/cache", delete(invalidate_all))
        // System routes
        .route("/api/v1/health-monitor/stats", get(get_health_monitor_stats))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Register a service instance
pub async fn register_service(
    State(state): State<AppState>,
    Json(request): Json<RegisterServiceRequest>,
) -> ApiResult<RegistrationReceipt> {
    debug!("Registering instance of service: {}", request.name);

    let (descriptor, instance) = request.into_parts().map_err(api_error)?;
    let receipt = state
        .registry
        .register(descriptor, instance)
        .await
        .map_err(api_error)?;

    if !receipt.cache_consistent {
        warn!(
            "Registered {} but cache invalidation was not confirmed",
            receipt.service
        );
    }
    Ok(Json(ApiResponse::success(receipt)))
}

/// Remove a service and all of its instances
pub async fn deregister_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<bool> {
    let existed = state
        .registry
        .deregister_service(&name)
        .await
        .map_err(api_error)?;

    if !existed {
        return Err(api_error(RegistryError::ServiceNotFound(name)));
    }
    Ok(Json(ApiResponse::success(true)))
}

/// Remove one instance; unknown instances succeed
pub async fn deregister_instance(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, Uuid)>,
) -> ApiResult<String> {
    state
        .registry
        .deregister(&name, id)
        .await
        .map_err(api_error)?;

    Ok(Json(ApiResponse::success(format!(
        "Instance {} of {} deregistered",
        id, name
    ))))
}

/// Change the connection method of a service
pub async fn update_connection_method(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<UpdateConnectionMethodRequest>,
) -> ApiResult<MethodChange> {
    let method: ConnectionMethod = request.connection_method.parse().map_err(api_error)?;

    let change = match method {
        ConnectionMethod::Disabled => state.registry.disable_service(&name, request.reason).await,
        other => state.registry.update_connection_method(&name, other).await,
    }
    .map_err(api_error)?;

    info!(
        "Connection method of {} updated {} -> {}",
        name, change.old_method, change.new_method
    );
    Ok(Json(ApiResponse::success(change)))
}

/// Status, health and instances of a service
pub async fn get_service_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<ServiceStatusReport> {
    let report = state
        .registry
        .get_service_status(&name)
        .await
        .map_err(api_error)?;
    Ok(Json(ApiResponse::success(report)))
}

/// Probe an instance now
pub async fn check_instance(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, Uuid)>,
) -> ApiResult<ServiceStatusReport> {
    if state.health_monitor.check_now(id).await.is_none() {
        return Err(api_error(RegistryError::validation(
            "id",
            format!("instance {} of {} is not tracked", id, name),
        )));
    }

    let report = state
        .registry
        .get_service_status(&name)
        .await
        .map_err(api_error)?;
    Ok(Json(ApiResponse::success(report)))
}

/// Accept health telemetry pushed by an instance
pub async fn report_instance_health(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, Uuid)>,
    Json(report): Json<HealthReport>,
) -> ApiResult<ServiceStatusReport> {
    let in_unit = |value: f64| (0.0..=1.0).contains(&value);
    if !in_unit(report.score) {
        return Err(api_error(RegistryError::validation(
            "score",
            "must be within [0, 1]",
        )));
    }
    if !report.load.map(in_unit).unwrap_or(true) {
        return Err(api_error(RegistryError::validation(
            "load",
            "must be within [0, 1]",
        )));
    }

    let owned = state
        .health_monitor
        .snapshot(id)
        .map(|snapshot| snapshot.instance.service_name == name)
        .unwrap_or(false);
    if !owned || !state.health_monitor.record_report(id, report) {
        return Err(api_error(RegistryError::validation(
            "id",
            format!("instance {} of {} is not tracked", id, name),
        )));
    }

    let status = state
        .registry
        .get_service_status(&name)
        .await
        .map_err(api_error)?;
    Ok(Json(ApiResponse::success(status)))
}

/// List all registered services
pub async fn list_services(State(state): State<AppState>) -> ApiResult<Vec<ServiceSummary>> {
    let services = state.registry.list_services().await.map_err(api_error)?;
    Ok(Json(ApiResponse::success(services)))
}

pub async fn get_cache_stats(State(state): State<AppState>) -> ApiResult<CacheStats> {
    let stats = state.registry.get_cache_stats().await.map_err(api_error)?;
    Ok(Json(ApiResponse::success(stats)))
}

/// Clear every registry entry from both cache tiers
pub async fn invalidate_all(State(state): State<AppState>) -> ApiResult<InvalidationResponse> {
    let removed_keys = state.registry.invalidate_all().await.map_err(api_error)?;
    Ok(Json(ApiResponse::success(InvalidationResponse { removed_keys })))
}

pub async fn get_health_monitor_stats(
    State(state): State<AppState>,
) -> Json<ApiResponse<HealthMonitoringStats>> {
    Json(ApiResponse::success(state.health_monitor.stats()))
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: crate::VERSION.to_string(),
        monitored_instances: state.health_monitor.stats().monitored_instances,
    }))
}
