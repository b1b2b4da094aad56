//! Envelope shared by everything the session engine publishes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Anything published on the session event channel
pub trait DomainEvent: Send + Sync {
    /// Returns the event type name
    fn event_type(&self) -> &'static str;

    /// Returns when the event occurred
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Identity and timestamp stamped on each event when it is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event_type: String,
}

impl EventMetadata {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event_type: event_type.into(),
        }
    }
}
