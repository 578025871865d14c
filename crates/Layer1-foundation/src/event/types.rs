//! Event Types - envelope shared by every typed event stream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Event ID
// ============================================================================

/// Unique event identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Event Record
// ============================================================================

/// A published event together with its origin and publish time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord<E> {
    pub id: EventId,

    /// Namespace of the publisher (an instance id, "fleet", ...)
    pub source: String,

    pub timestamp: DateTime<Utc>,

    pub payload: E,
}

impl<E> EventRecord<E> {
    pub fn new(source: impl Into<String>, payload: E) -> Self {
        Self {
            id: EventId::new(),
            source: source.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}
