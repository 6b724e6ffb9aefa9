//! services/grader/src/bin/grader.rs
//!
//! Starts the grading service: database, container engine, pipeline and HTTP server.

use grader_lib::{
    adapters::{DockerRuntime, HostMetrics, PgStore},
    config::Config,
    error::StartupError,
    pipeline::Pipeline,
    web::{router, state::AppState},
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let store = Arc::new(PgStore::new(db_pool));
    info!("Running database migrations...");
    store.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    let runtime = Arc::new(DockerRuntime::connect()?);
    let metrics = Arc::new(HostMetrics::new());
    tokio::fs::create_dir_all(&config.submissions_dir)
        .await
        .map_err(|source| StartupError::SubmissionsDir {
            path: config.submissions_dir.clone(),
            source,
        })?;

    // --- 4. Start the Pipeline & Build the Shared AppState ---
    let pipeline = Arc::new(Pipeline::start(
        config.pipeline_settings(),
        store,
        runtime,
        metrics,
    ));
    let app_state = Arc::new(AppState::new(pipeline.clone()));
    let app = router(app_state);

    // --- 5. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .map_err(|source| StartupError::Bind {
            address: config.bind_address,
            source,
        })?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // --- 6. Drain the Pipeline ---
    pipeline.shutdown().await;
    served.map_err(StartupError::Serve)?;
    info!("Server stopped.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C.");
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
                warn!(error = %e, "Failed to listen for SIGTERM.");
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
    info!("Shutdown signal received.");
}
