use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use profile_photo_dispatcher::{
    app_state::AppState,
    config::AppConfig,
    db,
    routes,
    services::{dispatcher::Dispatcher, generation::GenerationClient, prompt::PromptTemplate},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(worker_id = %config.worker_id, "Starting profile photo dispatcher");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    // Fail fast on a broken template rather than on every job
    let template = PromptTemplate::standard().expect("Prompt template is invalid");

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let generator = GenerationClient::new(
        config.generation_api_url.clone(),
        config.generation_api_key.clone(),
        config.generation_timeout(),
    )
    .expect("Failed to initialize generation client");

    let settings = config.dispatch_settings();
    let state = AppState::new(db_pool.clone(), &settings.worker_id, settings.lease_timeout);
    let dispatcher = Dispatcher::new(db_pool, generator, template, settings);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let dispatcher_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };

    let app = routes::router(state).merge(routes::metrics::router(prometheus_handle));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Health endpoint listening on {}", config.bind_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "Health server error");
        cancel.cancel();
    }

    if let Err(e) = dispatcher_task.await {
        tracing::error!(error = %e, "Dispatcher task panicked");
    }

    tracing::info!("Shutdown complete");
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for ctrl-c");
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
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
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

    tracing::info!("Shutdown signal received, finishing current job");
    token.cancel();
}
