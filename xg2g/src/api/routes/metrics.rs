//! Prometheus scrape endpoint.

use axum::{
    Router,
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;

/// Content type of the Prometheus text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router() -> Router<AppState> {
    Router::new().route("/metrics", get(export_metrics))
}

async fn export_metrics(State(state): State<AppState>) -> ApiResult<Response> {
    let exporter = state
        .exporter
        .as_ref()
        .ok_or_else(|| ApiError::not_found("Metrics are not enabled"))?;

    Ok(([(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], exporter.export()).into_response())
}
