//! Tasks: the atom of work distribution.
//!
//! A task is one unit of work for one agent. The wire contract keeps the
//! `type`/`action` strings and a free-form `config` map; internally the
//! config is a tagged payload union validated at the boundary.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority for initial `deploy_pipeline` tasks.
pub const PRIORITY_DEPLOY: i32 = 10;
/// Priority for `stop_pipeline` tasks; preempts queued deploys.
pub const PRIORITY_STOP: i32 = 20;

// ── Enums ────────────────────────────────────────────────────────────

/// The two arms of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Baseline,
    Candidate,
}

impl Variant {
    pub const ALL: [Variant; 2] = [Variant::Baseline, Variant::Candidate];

    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Baseline => "baseline",
            Variant::Candidate => "candidate",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    DeployPipeline,
    StopPipeline,
    Collector,
    Loadsim,
    Command,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::DeployPipeline => "deploy_pipeline",
            TaskType::StopPipeline => "stop_pipeline",
            TaskType::Collector => "collector",
            TaskType::Loadsim => "loadsim",
            TaskType::Command => "command",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Start,
    Stop,
    Update,
    Deploy,
    Undeploy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Expired,
}

impl TaskStatus {
    /// An active task holds (or is eligible for) a claim.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Typed payloads ───────────────────────────────────────────────────

/// Deploy a rendered pipeline config for one experiment variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployPipelinePayload {
    pub pipeline_url: String,
    pub variant: Variant,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushgateway_url: Option<String>,
}

/// Tear down a deployed variant (or everything for the experiment when
/// `variant` is unset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopPipelinePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<Variant>,
}

/// Drive a synthetic load profile on the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSimPayload {
    pub profile: String,
    pub duration_secs: u64,
}

/// Run an arbitrary agent-side command (also used for `collector` tasks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Typed view over a task's `config` map, selected by the task type.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    DeployPipeline(DeployPipelinePayload),
    StopPipeline(StopPipelinePayload),
    LoadSim(LoadSimPayload),
    Command(CommandPayload),
}

// ── Task ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Target host; `"*"` means any poller may claim it.
    pub host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub action: TaskAction,
    /// Wire-format payload; see [`Task::payload`] for the typed view.
    pub config: serde_json::Value,
    pub priority: i32,
    pub status: TaskStatus,
    pub retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Construct a pending task with a typed payload.
    pub fn new(
        host_id: impl Into<String>,
        experiment_id: Option<Uuid>,
        action: TaskAction,
        priority: i32,
        payload: &TaskPayload,
    ) -> Self {
        let now = Utc::now();
        let (task_type, config) = match payload {
            TaskPayload::DeployPipeline(p) => {
                (TaskType::DeployPipeline, serde_json::to_value(p))
            }
            TaskPayload::StopPipeline(p) => (TaskType::StopPipeline, serde_json::to_value(p)),
            TaskPayload::LoadSim(p) => (TaskType::Loadsim, serde_json::to_value(p)),
            TaskPayload::Command(p) => (TaskType::Command, serde_json::to_value(p)),
        };
        Self {
            id: Uuid::new_v4(),
            host_id: host_id.into(),
            experiment_id,
            task_type,
            action,
            // Payload structs serialize infallibly (string/number fields only).
            config: config.unwrap_or_else(|_| serde_json::json!({})),
            priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deploy task for one (host, variant) pair of an experiment.
    pub fn deploy_pipeline(
        host_id: impl Into<String>,
        experiment_id: Uuid,
        payload: DeployPipelinePayload,
    ) -> Self {
        Self::new(
            host_id,
            Some(experiment_id),
            TaskAction::Deploy,
            PRIORITY_DEPLOY,
            &TaskPayload::DeployPipeline(payload),
        )
    }

    /// Stop task; enqueued at preempting priority.
    pub fn stop_pipeline(
        host_id: impl Into<String>,
        experiment_id: Option<Uuid>,
        variant: Option<Variant>,
    ) -> Self {
        Self::new(
            host_id,
            experiment_id,
            TaskAction::Undeploy,
            PRIORITY_STOP,
            &TaskPayload::StopPipeline(StopPipelinePayload { variant }),
        )
    }

    /// Validate and decode the config map into the typed payload.
    pub fn payload(&self) -> crate::Result<TaskPayload> {
        let payload = match self.task_type {
            TaskType::DeployPipeline => {
                TaskPayload::DeployPipeline(serde_json::from_value(self.config.clone())?)
            }
            TaskType::StopPipeline => {
                TaskPayload::StopPipeline(serde_json::from_value(self.config.clone())?)
            }
            TaskType::Loadsim => TaskPayload::LoadSim(serde_json::from_value(self.config.clone())?),
            TaskType::Collector | TaskType::Command => {
                TaskPayload::Command(serde_json::from_value(self.config.clone())?)
            }
        };
        Ok(payload)
    }

    /// The variant this task deploys or stops, if any.
    pub fn variant(&self) -> Option<Variant> {
        match self.payload().ok()? {
            TaskPayload::DeployPipeline(p) => Some(p.variant),
            TaskPayload::StopPipeline(p) => p.variant,
            _ => None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn deploy_payload(variant: Variant) -> DeployPipelinePayload {
        DeployPipelinePayload {
            pipeline_url: "http://configs/candidate.yaml".into(),
            variant,
            variables: HashMap::from([("sample_rate".into(), "0.1".into())]),
            pushgateway_url: None,
        }
    }

    #[test]
    fn test_deploy_task_round_trips_payload() {
        let exp = Uuid::new_v4();
        let task = Task::deploy_pipeline("h1", exp, deploy_payload(Variant::Candidate));
        assert_eq!(task.task_type, TaskType::DeployPipeline);
        assert_eq!(task.priority, PRIORITY_DEPLOY);
        assert_eq!(task.status, TaskStatus::Pending);

        match task.payload().unwrap() {
            TaskPayload::DeployPipeline(p) => {
                assert_eq!(p.variant, Variant::Candidate);
                assert_eq!(p.variables["sample_rate"], "0.1");
            }
            other => panic!("expected deploy payload, got {other:?}"),
        }
        assert_eq!(task.variant(), Some(Variant::Candidate));
    }

    #[test]
    fn test_stop_task_preempts_deploys() {
        let task = Task::stop_pipeline("h1", None, Some(Variant::Baseline));
        assert_eq!(task.task_type, TaskType::StopPipeline);
        assert!(task.priority > PRIORITY_DEPLOY);
        assert_eq!(task.action, TaskAction::Undeploy);
    }

    #[test]
    fn test_payload_validation_rejects_malformed_config() {
        let mut task = Task::deploy_pipeline(
            "h1",
            Uuid::new_v4(),
            deploy_payload(Variant::Baseline),
        );
        task.config = serde_json::json!({"variant": "neither"});
        assert_eq!(task.payload().unwrap_err().code(), "validation_failed");
    }

    #[test]
    fn test_status_classification() {
        assert!(TaskStatus::Pending.is_active());
        assert!(TaskStatus::Assigned.is_active());
        assert!(TaskStatus::Running.is_active());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Expired.is_terminal());
        assert!(!TaskStatus::Completed.is_active());
    }

    #[test]
    fn test_wire_format_keeps_type_and_action_strings() {
        let task = Task::deploy_pipeline("h1", Uuid::new_v4(), deploy_payload(Variant::Baseline));
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "deploy_pipeline");
        assert_eq!(json["action"], "deploy");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["config"]["variant"], "baseline");
    }

    #[test]
    fn test_variant_serde() {
        assert_eq!(serde_json::to_string(&Variant::Candidate).unwrap(), r#""candidate""#);
        let v: Variant = serde_json::from_str(r#""baseline""#).unwrap();
        assert_eq!(v, Variant::Baseline);
    }

    #[test]
    fn test_command_payload_for_collector_tasks() {
        let payload = TaskPayload::Command(CommandPayload {
            command: "restart".into(),
            args: vec!["--drain".into()],
            timeout_secs: Some(60),
        });
        let mut task = Task::new("h2", None, TaskAction::Update, 5, &payload);
        task.task_type = TaskType::Collector;
        match task.payload().unwrap() {
            TaskPayload::Command(c) => assert_eq!(c.command, "restart"),
            other => panic!("expected command payload, got {other:?}"),
        }
    }
}
