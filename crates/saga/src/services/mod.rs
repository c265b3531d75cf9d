//! Collaborators the coordinator calls at saga start and end.

pub mod directory;
pub mod notifier;

pub use directory::{InMemoryParticipantDirectory, ParticipantDirectory};
pub use notifier::{InMemoryNotifier, LoggingNotifier, Notifier, OutcomeNotification};
