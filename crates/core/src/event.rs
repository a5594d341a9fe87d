//! Append-only experiment event log.
//!
//! Events are the durable audit trail and the backing history for the
//! WebSocket topics. Order within an experiment matches append order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::experiment::Phase;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic sequence assigned by the store at append time.
    pub seq: i64,
    pub experiment_id: Uuid,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Event payload before the store assigns a sequence number.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub experiment_id: Uuid,
    pub event_type: String,
    pub phase: Option<Phase>,
    pub message: String,
    pub metadata: serde_json::Value,
}

impl NewEvent {
    pub fn phase_change(experiment_id: Uuid, phase: Phase, reason: impl Into<String>) -> Self {
        Self {
            experiment_id,
            event_type: "phase_change".into(),
            phase: Some(phase),
            message: reason.into(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn note(experiment_id: Uuid, event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            experiment_id,
            event_type: event_type.into(),
            phase: None,
            message: message.into(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
