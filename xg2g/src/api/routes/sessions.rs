//! Session introspection and cancellation.

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::middleware::{Principal, Scope};
use crate::api::routes::hls;
use crate::api::server::AppState;
use crate::session::{Session, SessionState};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_sessions))
        .route("/{id}", get(get_session).delete(cancel_session))
        .route("/{id}/hls/{filename}", get(hls::serve_hls_file))
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionListQuery {
    /// Only sessions in this state, e.g. `running`.
    pub state: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub items: Vec<Session>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

async fn list_sessions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<SessionListQuery>,
) -> ApiResult<Json<SessionListResponse>> {
    principal.require(Scope::Admin)?;

    let filter = query
        .state
        .as_deref()
        .map(|s| {
            s.parse::<SessionState>()
                .map_err(|_| ApiError::bad_request(format!("Unknown session state '{s}'")))
        })
        .transpose()?;

    let sessions: Vec<Session> = state
        .store
        .list()
        .into_iter()
        .filter(|s| filter.is_none_or(|f| s.state == f))
        .collect();

    let total = sessions.len();
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let items = sessions.into_iter().skip(offset).take(limit).collect();

    Ok(Json(SessionListResponse {
        items,
        total,
        limit,
        offset,
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    principal.require(Scope::Read)?;

    state
        .store
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Session with id '{}' not found", id)))
}

/// Request cancellation. The terminal state is recorded asynchronously.
async fn cancel_session(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    principal.require(Scope::Write)?;

    let session = state.supervisor.cancel(&id)?;
    Ok((StatusCode::ACCEPTED, Json(session)))
}
