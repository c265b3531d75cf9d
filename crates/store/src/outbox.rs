use chrono::{DateTime, Utc};
use common::MessageId;
use serde::{Deserialize, Serialize};

/// An outbound broker message committed together with the state change
/// that caused it.
///
/// The message stays in the outbox until it is marked published; a relay
/// re-sends anything left unpublished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub routing_key: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Creates an unpublished message.
    pub fn new(routing_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: MessageId::new(),
            routing_key: routing_key.into(),
            payload,
            created_at: Utc::now(),
            published_at: None,
        }
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}
