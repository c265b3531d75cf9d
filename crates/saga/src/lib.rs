//! Saga protocol for multi-step approvals across two stores.
//!
//! The Request side ([`SagaCoordinator`]) owns the canonical documents; the
//! Processing side ([`StepExecutor`]) decides who may act on the current
//! step. They only talk through the broker:
//!
//! 1. The coordinator commits a document and requests step 1
//! 2. The executor records a pending view and waits for the approver
//! 3. The approver's decision goes back as a step outcome
//! 4. The coordinator applies it, then requests the next step or finalizes
//!
//! Delivery is at-least-once. Both sides check persisted status before every
//! transition, so redeliveries are no-ops, and every outbound message goes
//! through a transactional outbox so it is never announced before the state
//! change that caused it is durable.

pub mod broker;
pub mod consumer;
pub mod coordinator;
pub mod deadline;
pub mod error;
pub mod executor;
pub mod locks;
pub mod messages;
pub mod publisher;
pub mod runtime;
pub mod services;

pub use broker::{BrokerError, Delivery, InMemoryBroker, MessageBroker};
pub use consumer::{Consumer, ConsumerSettings, MessageHandler, Settlement};
pub use coordinator::{CreateDocument, OutcomeApplied, SagaCoordinator};
pub use deadline::Timeouts;
pub use error::{ErrorKind, Result, SagaError};
pub use executor::{StepExecutor, StepRequestReceived};
pub use locks::DocumentLocks;
pub use messages::{
    Channel, EXCHANGE, MessageKey, SagaMessage, StepOutcomeEvent, StepRequestEvent,
};
pub use publisher::{OutboxRelay, OutcomePublisher, RelaySettings};
pub use runtime::{RuntimeSettings, SagaRuntime};
pub use services::{
    InMemoryNotifier, InMemoryParticipantDirectory, LoggingNotifier, Notifier,
    OutcomeNotification, ParticipantDirectory,
};
