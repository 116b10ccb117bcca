//! Intent submission.

use axum::{Extension, Json, Router, extract::State, http::StatusCode, routing::post};
use serde::Serialize;

use crate::api::error::ApiResult;
use crate::api::middleware::{Principal, Scope};
use crate::api::server::AppState;
use crate::control::Intent;
use crate::session::SessionState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(submit_intent))
}

#[derive(Debug, Serialize)]
pub struct IntentResponse {
    pub session_id: String,
    pub state: SessionState,
}

/// Admit and start a playback intent.
///
/// Admission and resolution failures are answered here; nothing is created
/// for them. Later failures show up in the session's state.
async fn submit_intent(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(intent): Json<Intent>,
) -> ApiResult<(StatusCode, Json<IntentResponse>)> {
    principal.require(Scope::Write)?;

    let intent = intent.with_requested_by(principal.name);
    let session = state.supervisor.submit(intent).await?;

    Ok((
        StatusCode::CREATED,
        Json(IntentResponse {
            session_id: session.id,
            state: session.state,
        }),
    ))
}
