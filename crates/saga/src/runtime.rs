//! Background tasks of a running saga: one consumer and one outbox relay
//! per side.

use std::sync::Arc;

use store::{DocumentStore, OutboxStore, StepViewStore};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::broker::MessageBroker;
use crate::consumer::{Consumer, ConsumerSettings};
use crate::coordinator::SagaCoordinator;
use crate::executor::StepExecutor;
use crate::messages::Channel;
use crate::publisher::{OutboxRelay, RelaySettings};
use crate::services::{Notifier, ParticipantDirectory};

/// Settings for every background task.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeSettings {
    pub consumer: ConsumerSettings,
    pub relay: RelaySettings,
}

/// Handle to the running consumers and relays.
pub struct SagaRuntime {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl SagaRuntime {
    /// Spawns the Request-side and Processing-side workers.
    pub fn start<R, P, D, N>(
        coordinator: Arc<SagaCoordinator<R, D, N>>,
        executor: Arc<StepExecutor<P>>,
        broker: Arc<dyn MessageBroker>,
        settings: RuntimeSettings,
    ) -> Self
    where
        R: DocumentStore + OutboxStore + Clone + 'static,
        P: StepViewStore + OutboxStore + Clone + 'static,
        D: ParticipantDirectory + 'static,
        N: Notifier + 'static,
    {
        let (shutdown, signal) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let request_relay = OutboxRelay::new(
            "request",
            coordinator.store().clone(),
            coordinator.publisher().clone(),
            settings.relay,
        );
        let processing_relay = OutboxRelay::new(
            "processing",
            executor.store().clone(),
            executor.publisher().clone(),
            settings.relay,
        );

        let outcome_consumer = Consumer::new(
            "coordinator",
            Channel::StepOutcome.queue(),
            broker.clone(),
            coordinator,
            settings.consumer,
        );
        let request_consumer = Consumer::new(
            "executor",
            Channel::StepRequest.queue(),
            broker,
            executor,
            settings.consumer,
        );

        tasks.spawn(outcome_consumer.run(signal.clone()));
        tasks.spawn(request_consumer.run(signal.clone()));
        tasks.spawn(request_relay.run(signal.clone()));
        tasks.spawn(processing_relay.run(signal));

        tracing::info!("saga runtime started");
        Self { shutdown, tasks }
    }

    /// Signals every task to stop and waits for in-flight work to drain.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "saga task panicked");
            }
        }
        tracing::info!("saga runtime stopped");
    }
}
