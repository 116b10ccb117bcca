//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;

use crate::api::server::AppState;
use crate::metrics::{ComponentHealth, HealthStatus};

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/live", get(liveness_check))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub active_sessions: usize,
    pub components: Vec<ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f32>,
}

/// Aggregated health of every registered check.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = state.start_time.elapsed().as_secs();
    let active_sessions = state.store.count_active();

    if let Some(health_checker) = &state.health_checker {
        let report = health_checker.check_all().await;

        Json(HealthResponse {
            status: report.status,
            version: report.version.to_string(),
            uptime_secs: uptime,
            active_sessions,
            components: report.components,
            cpu_usage: Some(report.cpu_usage),
            memory_usage: Some(report.memory_usage),
        })
    } else {
        // Fallback for tests without a health checker
        Json(HealthResponse {
            status: HealthStatus::Healthy,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: uptime,
            active_sessions,
            components: vec![],
            cpu_usage: None,
            memory_usage: None,
        })
    }
}

/// Readiness check - is the service ready to accept intents?
/// Returns HTTP 200 if healthy/degraded, HTTP 503 if unhealthy/unknown.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(health_checker) = &state.health_checker {
        if health_checker.check_ready().await {
            (StatusCode::OK, "ready")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "not ready")
        }
    } else {
        (StatusCode::OK, "ready")
    }
}

/// Liveness check - always 200 while the process answers.
async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": uptime
        })),
    )
}
