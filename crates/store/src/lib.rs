//! Storage for both sides of the approval saga.
//!
//! The saga logic only sees the traits in [`store`]: versioned reads,
//! inserts, and compare-and-swap writes that commit an outbox batch in the
//! same atomic step. [`InMemoryStore`] is the test double,
//! [`PostgresStore`] the durable implementation.

pub mod error;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod store;
pub mod version;

pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use outbox::OutboxMessage;
pub use postgres::PostgresStore;
pub use store::{DocumentStore, OutboxStore, StepViewStore};
pub use version::{Version, Versioned};
