//! Events, dead letters and statistics of the message bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use woodwork_common::types::SessionId;

use crate::component::Payload;

/// A message published on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: Uuid,
    /// Topic the event was published on.
    pub topic: String,
    /// Event body.
    pub payload: Payload,
    /// Session the event belongs to.
    pub session_id: Option<SessionId>,
    /// Component that published the event.
    pub source: Option<String>,
    /// Restricts delivery to the subscriber with this name.
    pub target: Option<String>,
    /// Publication time.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Creates an untargeted event.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            session_id: None,
            source: None,
            target: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the session.
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Sets the publishing component.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Restricts delivery to one subscriber.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Returns `true` if `subscriber` should receive the event.
    #[must_use]
    pub fn is_for(&self, subscriber: &str) -> bool {
        self.target.as_deref().is_none_or(|t| t == subscriber)
    }
}

/// A message dropped after its last failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    /// The undeliverable event.
    pub event: Event,
    /// Subscriber that kept failing.
    pub subscriber: String,
    /// Total delivery attempts made.
    pub attempts: u32,
    /// Error of the last attempt.
    pub error: String,
    /// When the message was given up.
    pub failed_at: DateTime<Utc>,
}

/// Snapshot of the bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Events accepted by `emit`.
    pub emitted: u64,
    /// Successful deliveries to a subscriber.
    pub delivered: u64,
    /// Deliveries re-queued after a failure.
    pub retried: u64,
    /// Messages given up on.
    pub dead_lettered: u64,
}
