//! HTTP API server for the approval saga.
//!
//! Exposes the Request side (submit and inspect documents) and the
//! Processing side (approver inboxes and decisions) over REST, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    InMemoryParticipantDirectory, LoggingNotifier, MessageBroker, OutcomePublisher,
    SagaCoordinator, StepExecutor,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::{AppState, SagaStore};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: SagaStore>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/approvals", post(routes::approvals::create::<S>))
        .route("/approvals", get(routes::approvals::list::<S>))
        .route("/approvals/{sequence_id}", get(routes::approvals::get::<S>))
        .route("/pending/{approver_id}", get(routes::decisions::pending::<S>))
        .route(
            "/decide/{approver_id}/{sequence_id}",
            post(routes::decisions::decide::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Wires both sides of the saga onto one broker.
///
/// The participant directory is seeded from `config.participants`.
pub fn create_default_state<S: SagaStore>(
    request_store: S,
    processing_store: S,
    broker: Arc<dyn MessageBroker>,
    config: &Config,
) -> Arc<AppState<S>> {
    let directory = InMemoryParticipantDirectory::with_participants(config.participants.clone());
    let publisher = OutcomePublisher::new(broker).with_timeout(config.timeouts().store);

    let coordinator = SagaCoordinator::new(
        request_store,
        directory,
        LoggingNotifier,
        publisher.clone(),
        config.timeouts(),
    );
    let executor = StepExecutor::new(processing_store, publisher, config.timeouts());

    Arc::new(AppState {
        coordinator: Arc::new(coordinator),
        executor: Arc::new(executor),
    })
}
