//! API server setup and configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::Request;
use axum::response::Response;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::middleware::TokenAuth;
use crate::api::routes;
use crate::control::SessionSupervisor;
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use crate::metrics::{HealthChecker, PrometheusExporter};
use crate::session::SessionStore;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub listen: SocketAddr,
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8088)),
            enable_cors: true,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    pub supervisor: Arc<SessionSupervisor>,
    pub store: Arc<SessionStore>,
    pub auth: TokenAuth,
    pub health_checker: Option<Arc<HealthChecker>>,
    pub exporter: Option<Arc<PrometheusExporter>>,
    /// Logging configuration for dynamic log level changes
    pub logging_config: Option<Arc<LoggingConfig>>,
}

impl AppState {
    pub fn new(supervisor: Arc<SessionSupervisor>) -> Self {
        Self {
            start_time: Instant::now(),
            store: supervisor.store().clone(),
            supervisor,
            auth: TokenAuth::default(),
            health_checker: None,
            exporter: None,
            logging_config: None,
        }
    }

    pub fn with_auth(mut self, auth: TokenAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_health_checker(mut self, health_checker: Arc<HealthChecker>) -> Self {
        self.health_checker = Some(health_checker);
        self
    }

    pub fn with_exporter(mut self, exporter: Arc<PrometheusExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_logging_config(mut self, config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(config);
        self
    }
}

fn is_probe_path(path: &str) -> bool {
    path.starts_with("/health") || path == "/metrics"
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            state,
            cancel_token,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all middleware and routes.
    pub fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        // Probe endpoints are polled constantly; keep them out of the request log.
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let path = req.uri().path();
                    if is_probe_path(path) {
                        Span::none()
                    } else {
                        tracing::info_span!("http", method = %req.method(), path = %path)
                    }
                })
                .on_request(())
                .on_response(|res: &Response, latency: Duration, span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    let status = res.status();
                    let latency_ms = latency.as_millis() as u64;
                    if status.is_server_error() {
                        tracing::warn!(parent: span, status = status.as_u16(), latency_ms, "request failed");
                    } else {
                        tracing::debug!(parent: span, status = status.as_u16(), latency_ms, "request done");
                    }
                })
                .on_failure(()),
        )
    }

    /// Serve until the cancel token fires, then drain in-flight requests.
    pub async fn run(&self) -> Result<()> {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.listen)
            .await
            .map_err(|e| Error::io_path("bind", self.config.listen.to_string(), e))?;

        tracing::info!("API server listening on http://{}", self.config.listen);

        let cancel_token = self.cancel_token.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await
            .map_err(|e| Error::Other(format!("Server error: {}", e)))?;

        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
