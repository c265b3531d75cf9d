//! HTTP route handlers and the state they share.

pub mod approvals;
pub mod decisions;
pub mod health;
pub mod metrics;

use std::sync::Arc;

use saga::{InMemoryParticipantDirectory, LoggingNotifier, SagaCoordinator, StepExecutor};
use store::{DocumentStore, OutboxStore, StepViewStore};

/// Any store that can back both sides of the saga.
pub trait SagaStore: DocumentStore + StepViewStore + OutboxStore + Clone + 'static {}

impl<T> SagaStore for T where T: DocumentStore + StepViewStore + OutboxStore + Clone + 'static {}

pub type Coordinator<S> = SagaCoordinator<S, InMemoryParticipantDirectory, LoggingNotifier>;

/// Shared application state accessible from all handlers.
///
/// The coordinator and executor each hold their own store instance; they
/// share nothing but the broker.
pub struct AppState<S: SagaStore> {
    pub coordinator: Arc<Coordinator<S>>,
    pub executor: Arc<StepExecutor<S>>,
}
