//! API route modules.
//!
//! Everything under `/api` passes the token middleware. Health and metrics
//! probes stay public.

pub mod health;
pub mod hls;
pub mod intents;
pub mod logging;
pub mod metrics;
pub mod sessions;

use axum::{Router, middleware};

use crate::api::middleware::token_auth;
use crate::api::server::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .nest("/intents", intents::router())
        .nest("/sessions", sessions::router())
        .nest("/logging", logging::router())
        .layer(middleware::from_fn_with_state(state.auth.clone(), token_auth));

    Router::new()
        .nest("/api", api)
        .nest("/health", health::router())
        .merge(metrics::router())
        .with_state(state)
}
