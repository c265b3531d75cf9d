//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use api::routes::SagaStore;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{InMemoryBroker, MessageBroker, SagaRuntime};
use sqlx::postgres::PgPoolOptions;
use store::{InMemoryStore, PostgresStore};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (text, json) = match config.log_format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
}

/// Starts the saga workers, serves HTTP until a shutdown signal, then
/// drains the workers.
async fn serve<S: SagaStore>(
    config: Config,
    request_store: S,
    processing_store: S,
    metrics_handle: PrometheusHandle,
) {
    let broker = InMemoryBroker::with_saga_topology(config.max_delivery_attempts)
        .await
        .with_visibility_timeout(config.visibility_timeout());
    let broker: Arc<dyn MessageBroker> = Arc::new(broker);

    let state = api::create_default_state(request_store, processing_store, broker.clone(), &config);
    let runtime = SagaRuntime::start(
        state.coordinator.clone(),
        state.executor.clone(),
        broker,
        config.runtime_settings(),
    );

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    runtime.shutdown().await;
    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);

    if config.participants.is_empty() {
        tracing::warn!("PARTICIPANTS is empty; every approval will be rejected as unknown");
    }

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the stores and serve
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");

            let request_store = PostgresStore::new(pool.clone(), "request");
            request_store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            let processing_store = PostgresStore::new(pool, "processing");

            tracing::info!("using PostgreSQL stores");
            serve(config, request_store, processing_store, metrics_handle).await;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory stores");
            serve(
                config,
                InMemoryStore::new(),
                InMemoryStore::new(),
                metrics_handle,
            )
            .await;
        }
    }
}
