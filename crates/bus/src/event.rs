//! Domain events carried on the bus.
//!
//! Only component owners publish: the state machine emits experiment
//! events, the queue emits task events, the registry emits agent events,
//! the KPI evaluator emits metric events. Consumers are read-only.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use phoenix_core::{KpiResult, Liveness, Phase, TaskStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// An experiment changed phase (or was mutated in place).
    ExperimentUpdate {
        experiment_id: Uuid,
        phase: Phase,
        reason: String,
    },
    /// A task was enqueued; advisory wake for parked pollers.
    TaskEnqueued {
        task_id: Uuid,
        host_id: String,
        priority: i32,
    },
    /// A task moved between statuses.
    TaskStatusChanged {
        task_id: Uuid,
        host_id: String,
        experiment_id: Option<Uuid>,
        status: TaskStatus,
    },
    /// An agent's derived liveness tier changed.
    AgentStatus {
        host_id: String,
        liveness: Liveness,
    },
    /// A KPI evaluation finished.
    KpiUpdate {
        experiment_id: Uuid,
        result: Box<KpiResult>,
    },
    /// Free-form operator notification.
    Notification { message: String },
}

impl DomainEvent {
    /// Experiment this event belongs to, when scoped to one.
    pub fn experiment_id(&self) -> Option<Uuid> {
        match self {
            DomainEvent::ExperimentUpdate { experiment_id, .. } => Some(*experiment_id),
            DomainEvent::TaskStatusChanged { experiment_id, .. } => *experiment_id,
            DomainEvent::KpiUpdate { experiment_id, .. } => Some(*experiment_id),
            _ => None,
        }
    }

    /// Outbound WebSocket frame type for this event.
    pub fn frame_type(&self) -> &'static str {
        match self {
            DomainEvent::ExperimentUpdate { .. } => "experiment_update",
            DomainEvent::TaskEnqueued { .. } | DomainEvent::TaskStatusChanged { .. } => {
                "task_status"
            }
            DomainEvent::AgentStatus { .. } => "agent_status",
            DomainEvent::KpiUpdate { .. } => "metric_update",
            DomainEvent::Notification { .. } => "notification",
        }
    }
}

/// Outbound WebSocket frame: `{type, data, timestamp}`.
#[derive(Debug, Clone, Serialize)]
pub struct Frame<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub data: &'a DomainEvent,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    pub fn to_frame_json(&self) -> String {
        let frame = Frame {
            frame_type: self.frame_type(),
            data: self,
            timestamp: Utc::now(),
        };
        serde_json::to_string(&frame).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_types() {
        let ev = DomainEvent::ExperimentUpdate {
            experiment_id: Uuid::new_v4(),
            phase: Phase::Failed,
            reason: "criteria not met".into(),
        };
        assert_eq!(ev.frame_type(), "experiment_update");

        let json: serde_json::Value =
            serde_json::from_str(&ev.to_frame_json()).unwrap();
        assert_eq!(json["type"], "experiment_update");
        assert_eq!(json["data"]["phase"], "failed");
        assert_eq!(json["data"]["reason"], "criteria not met");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_experiment_scoping() {
        let id = Uuid::new_v4();
        let scoped = DomainEvent::ExperimentUpdate {
            experiment_id: id,
            phase: Phase::Running,
            reason: "warm-up elapsed".into(),
        };
        let unscoped = DomainEvent::AgentStatus {
            host_id: "h1".into(),
            liveness: Liveness::Offline,
        };
        assert_eq!(scoped.experiment_id(), Some(id));
        assert_eq!(unscoped.experiment_id(), None);
    }
}
