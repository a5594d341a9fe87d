//! The durable store: the only persistent state in the control plane.
//!
//! Every mutable row lives here; in-memory components hold derived caches
//! only and rebuild them on restart. The store is also the sole arbiter of
//! mutual exclusion between parallel handlers: task claims are atomic
//! single-statement operations and experiment writes use an optimistic
//! version column.
//!
//! Two backends implement the [`Store`] trait: [`PgStore`] (PostgreSQL via
//! sqlx, the production backend) and [`MemStore`] (a single-process map,
//! used by the test suites and dev mode).

mod mem;
mod pg;
mod update;

pub use mem::MemStore;
pub use pg::PgStore;

pub(crate) use update::apply_task_update;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use phoenix_core::{
    ActivePipeline, AgentRecord, EventRecord, Experiment, KpiResult, MetricRow, NewEvent, Phase,
    Result, Task, TaskStatus,
};

// ── Query/update parameter types ─────────────────────────────────────

/// Filters for the operator task view; all fields AND together.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub experiment_id: Option<Uuid>,
    pub host_id: Option<String>,
    pub status: Option<TaskStatus>,
}

/// Agent-reported task outcome applied by `update_task_status`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatusUpdate {
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl TaskStatusUpdate {
    pub fn running() -> Self {
        Self {
            status: TaskStatus::Running,
            result: None,
            error_message: None,
        }
    }

    pub fn completed(result: Option<serde_json::Value>) -> Self {
        Self {
            status: TaskStatus::Completed,
            result,
            error_message: None,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            result: None,
            error_message: Some(error_message.into()),
        }
    }
}

/// Outcome of one expired-claim sweep.
#[derive(Debug, Clone, Default)]
pub struct ExpiredSweep {
    /// Returned to `pending` with `retry_count` incremented.
    pub requeued: Vec<Task>,
    /// Retries exhausted; now terminally `failed`.
    pub failed: Vec<Task>,
}

impl ExpiredSweep {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

// ── Store contract ───────────────────────────────────────────────────

/// Transactional persistence contract.
///
/// Failure model: operations fail `Transient` (caller retries) or
/// `Conflict` (surfaced to the state machine); reads of a missing row fail
/// `NotFound`.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Experiments ──────────────────────────────────────────────

    /// Insert a new experiment. A name clash fails `Conflict`.
    async fn create_experiment(&self, exp: &Experiment) -> Result<Experiment>;

    async fn get_experiment(&self, id: Uuid) -> Result<Experiment>;

    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>>;

    async fn list_experiments(&self, phase: Option<Phase>) -> Result<Vec<Experiment>>;

    /// Optimistic write: succeeds only when the stored version equals
    /// `exp.version`, bumping it by one. Version mismatch fails `Conflict`.
    async fn update_experiment(&self, exp: &Experiment) -> Result<Experiment>;

    // ── Tasks ────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<Task>;

    async fn get_task(&self, id: Uuid) -> Result<Task>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Atomically claim one ready task for `host_id` (its own tasks or the
    /// `"*"` wildcard), ordered by priority then age. Concurrent callers
    /// never receive the same row.
    async fn claim_one_task(&self, host_id: &str) -> Result<Option<Task>>;

    /// Apply an agent-reported outcome. Re-applying an identical update is
    /// a no-op; moving a terminal task elsewhere fails `Precondition`.
    async fn update_task_status(&self, id: Uuid, update: &TaskStatusUpdate) -> Result<Task>;

    /// Return lease-expired claims to `pending` (or `failed` once retries
    /// are exhausted).
    async fn requeue_expired_claims(&self, lease: Duration, max_retries: i32)
        -> Result<ExpiredSweep>;

    /// Withdraw still-pending tasks of an experiment (cancellation path);
    /// returns the tasks marked `expired`.
    async fn expire_pending_tasks(&self, experiment_id: Uuid) -> Result<Vec<Task>>;

    // ── Agents ───────────────────────────────────────────────────

    /// Last-writer-wins upsert keyed by host id; `first_seen` is kept from
    /// the existing row.
    async fn upsert_agent(&self, record: &AgentRecord) -> Result<AgentRecord>;

    async fn get_agent(&self, host_id: &str) -> Result<Option<AgentRecord>>;

    async fn list_agents(&self) -> Result<Vec<AgentRecord>>;

    // ── Active pipelines ─────────────────────────────────────────

    async fn insert_active_pipeline(&self, pipeline: &ActivePipeline) -> Result<ActivePipeline>;

    async fn get_active_pipeline(&self, id: Uuid) -> Result<ActivePipeline>;

    /// Soft-delete: sets `stopped_at`.
    async fn stop_active_pipeline(&self, id: Uuid) -> Result<ActivePipeline>;

    /// Live deployments, optionally scoped to a host.
    async fn list_active_pipelines(&self, host_id: Option<&str>) -> Result<Vec<ActivePipeline>>;

    /// Every deployment row for a host (the version history view).
    async fn list_pipeline_history(&self, host_id: &str) -> Result<Vec<ActivePipeline>>;

    // ── Experiment events ────────────────────────────────────────

    /// Append-only; total order within an experiment.
    async fn append_event(&self, event: NewEvent) -> Result<EventRecord>;

    async fn list_events(&self, experiment_id: Uuid, limit: i64) -> Result<Vec<EventRecord>>;

    // ── Metric cache ─────────────────────────────────────────────

    async fn insert_metrics(&self, rows: &[MetricRow]) -> Result<u64>;

    async fn list_metrics(&self, experiment_id: Uuid, limit: i64) -> Result<Vec<MetricRow>>;

    /// Drop rows older than the retention boundary; returns rows removed.
    async fn prune_metrics(&self, older_than: DateTime<Utc>) -> Result<u64>;

    // ── KPI results ──────────────────────────────────────────────

    async fn insert_kpi_result(&self, result: &KpiResult) -> Result<()>;

    async fn latest_kpi_result(&self, experiment_id: Uuid) -> Result<Option<KpiResult>>;

    async fn list_kpi_results(&self, experiment_id: Uuid, limit: i64) -> Result<Vec<KpiResult>>;
}
