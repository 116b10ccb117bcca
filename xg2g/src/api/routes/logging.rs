//! Runtime log filter.

use axum::{Extension, Json, Router, extract::State, routing::get};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::middleware::{Principal, Scope};
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_logging_config).put(update_logging_config))
}

#[derive(Debug, Serialize)]
pub struct LoggingConfigResponse {
    /// Active `EnvFilter` directive.
    pub filter: String,
    pub log_dir: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLogFilterRequest {
    pub filter: String,
}

async fn get_logging_config(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<LoggingConfigResponse>> {
    principal.require(Scope::Admin)?;

    let logging_config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::internal("Logging configuration not available"))?;

    Ok(Json(LoggingConfigResponse {
        filter: logging_config.current_filter(),
        log_dir: logging_config.log_dir().display().to_string(),
    }))
}

async fn update_logging_config(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<UpdateLogFilterRequest>,
) -> ApiResult<Json<LoggingConfigResponse>> {
    principal.require(Scope::Admin)?;

    let logging_config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::internal("Logging configuration not available"))?;

    logging_config.set_filter(&request.filter)?;
    tracing::info!(principal = %principal.name, filter = %request.filter, "Log filter updated");

    Ok(Json(LoggingConfigResponse {
        filter: logging_config.current_filter(),
        log_dir: logging_config.log_dir().display().to_string(),
    }))
}
