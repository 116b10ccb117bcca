use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use xg2g::api::{ApiServer, ApiServerConfig, AppState};
use xg2g::config::AppConfig;
use xg2g::services::ServiceContainer;
use xg2g::{logging, panic_hook};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env().context("failed to load configuration")?;

    let (logging_config, _log_guard) =
        logging::init_logging(&config.log_dir, config.log_retention_days)
            .context("failed to initialize logging")?;
    panic_hook::install(&config.log_dir);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        data_dir = %config.data_dir.display(),
        "Starting xg2g"
    );
    if !config.auth_enabled() {
        warn!("No API tokens configured; the API is open to every caller with admin scope");
    }

    let server_config = ApiServerConfig {
        listen: config.listen,
        ..ApiServerConfig::default()
    };

    let container = ServiceContainer::new(config)
        .await
        .context("failed to initialize services")?;
    container.start_background_tasks();
    container.track_task(logging_config.start_retention_cleanup(container.cancellation_token()));

    let state = AppState::new(container.supervisor.clone())
        .with_auth(container.auth.clone())
        .with_health_checker(container.health_checker.clone())
        .with_exporter(container.exporter.clone())
        .with_logging_config(logging_config);

    let server = ApiServer::new(server_config, state, container.cancellation_token());

    let shutdown_token = container.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    if let Err(e) = server.run().await {
        error!("API server failed: {}", e);
        container.shutdown_with_timeout(SHUTDOWN_TIMEOUT).await?;
        return Err(e.into());
    }

    container.shutdown_with_timeout(SHUTDOWN_TIMEOUT).await?;
    info!("xg2g stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
