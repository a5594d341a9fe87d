//! PostgreSQL store backend.
//!
//! Raw SQL through `sqlx::query_as` with bind parameters; enum columns are
//! TEXT, structured columns are JSONB. Single-assignment on tasks comes
//! from `FOR UPDATE SKIP LOCKED` inside the claim statement; experiment
//! writes are guarded by the version column.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use phoenix_core::{
    ActivePipeline, AgentRecord, Error, EventRecord, Experiment, KpiResult, MetricRow, NewEvent,
    Phase, Result, Task, TaskStatus,
};

use crate::{ExpiredSweep, Store, TaskFilter, TaskStatusUpdate};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run pending migrations. Failure here is fatal for the
    /// process (exit code 1).
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| Error::Transient(format!("postgres connect failed: {e}")))?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Transient(format!("migrations failed: {e}")))?;

        info!("PostgreSQL store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ── Error / enum plumbing ────────────────────────────────────────────

fn map_sqlx(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(ref db) = e {
        if db.code().as_deref() == Some("23505") {
            return Error::Conflict(format!("uniqueness violation: {db}"));
        }
    }
    Error::Transient(format!("database error: {e}"))
}

/// TEXT column value for a serde snake_case enum.
fn to_db_enum<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

/// Parse a TEXT column back into a serde snake_case enum. A value the
/// current binary does not know is an invariant violation on read.
fn from_db_enum<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| Error::Fatal(format!("corrupt {what} '{raw}' in store")))
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value, what: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Fatal(format!("corrupt {what} in store: {e}")))
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::Fatal(format!("unserializable {what}: {e}")))
}

// ── Row types ────────────────────────────────────────────────────────

const EXPERIMENT_COLS: &str = "id, name, description, phase, config, status, conditions, \
     promoted_variant, metadata, version, created_at, updated_at, started_at, completed_at";

#[derive(sqlx::FromRow)]
struct ExperimentRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    phase: String,
    config: serde_json::Value,
    status: serde_json::Value,
    conditions: serde_json::Value,
    promoted_variant: Option<String>,
    metadata: serde_json::Value,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExperimentRow> for Experiment {
    type Error = Error;

    fn try_from(row: ExperimentRow) -> Result<Experiment> {
        Ok(Experiment {
            id: row.id,
            name: row.name,
            description: row.description,
            phase: from_db_enum(&row.phase, "experiment phase")?,
            config: from_json(row.config, "experiment config")?,
            status: from_json(row.status, "experiment status")?,
            conditions: from_json(row.conditions, "experiment conditions")?,
            promoted_variant: row
                .promoted_variant
                .as_deref()
                .map(|v| from_db_enum(v, "promoted variant"))
                .transpose()?,
            metadata: from_json(row.metadata, "experiment metadata")?,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

const TASK_COLS: &str = "id, host_id, experiment_id, task_type, action, config, priority, \
     status, retry_count, assigned_at, started_at, completed_at, result, error_message, \
     created_at, updated_at";

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    host_id: String,
    experiment_id: Option<Uuid>,
    task_type: String,
    action: String,
    config: serde_json::Value,
    priority: i32,
    status: String,
    retry_count: i32,
    assigned_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = Error;

    fn try_from(row: TaskRow) -> Result<Task> {
        Ok(Task {
            id: row.id,
            host_id: row.host_id,
            experiment_id: row.experiment_id,
            task_type: from_db_enum(&row.task_type, "task type")?,
            action: from_db_enum(&row.action, "task action")?,
            config: row.config,
            priority: row.priority,
            status: from_db_enum(&row.status, "task status")?,
            retry_count: row.retry_count,
            assigned_at: row.assigned_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            result: row.result,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const AGENT_COLS: &str = "host_id, hostname, address, agent_version, declared_status, \
     capabilities, active_tasks, resources, first_seen, last_heartbeat";

#[derive(sqlx::FromRow)]
struct AgentRow {
    host_id: String,
    hostname: Option<String>,
    address: Option<String>,
    agent_version: Option<String>,
    declared_status: String,
    capabilities: serde_json::Value,
    active_tasks: serde_json::Value,
    resources: Option<serde_json::Value>,
    first_seen: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

impl TryFrom<AgentRow> for AgentRecord {
    type Error = Error;

    fn try_from(row: AgentRow) -> Result<AgentRecord> {
        Ok(AgentRecord {
            host_id: row.host_id,
            hostname: row.hostname,
            address: row.address,
            agent_version: row.agent_version,
            declared_status: row.declared_status,
            capabilities: from_json(row.capabilities, "agent capabilities")?,
            active_tasks: from_json(row.active_tasks, "agent active tasks")?,
            resources: row
                .resources
                .map(|r| from_json(r, "agent resources"))
                .transpose()?,
            first_seen: row.first_seen,
            last_heartbeat: row.last_heartbeat,
        })
    }
}

const PIPELINE_COLS: &str =
    "id, host_id, experiment_id, variant, pipeline_url, config_hash, variables, \
     deployed_at, stopped_at";

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: Uuid,
    host_id: String,
    experiment_id: Option<Uuid>,
    variant: String,
    pipeline_url: String,
    config_hash: String,
    variables: serde_json::Value,
    deployed_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
}

impl TryFrom<PipelineRow> for ActivePipeline {
    type Error = Error;

    fn try_from(row: PipelineRow) -> Result<ActivePipeline> {
        Ok(ActivePipeline {
            id: row.id,
            host_id: row.host_id,
            experiment_id: row.experiment_id,
            variant: from_db_enum(&row.variant, "pipeline variant")?,
            pipeline_url: row.pipeline_url,
            config_hash: row.config_hash,
            variables: from_json(row.variables, "pipeline variables")?,
            deployed_at: row.deployed_at,
            stopped_at: row.stopped_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    seq: i64,
    experiment_id: Uuid,
    event_type: String,
    phase: Option<String>,
    message: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = Error;

    fn try_from(row: EventRow) -> Result<EventRecord> {
        Ok(EventRecord {
            seq: row.seq,
            experiment_id: row.experiment_id,
            event_type: row.event_type,
            phase: row
                .phase
                .as_deref()
                .map(|p| from_db_enum(p, "event phase"))
                .transpose()?,
            message: row.message,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MetricCacheRow {
    experiment_id: Uuid,
    ts: DateTime<Utc>,
    metric_name: String,
    variant: Option<String>,
    host_id: String,
    value: f64,
    labels: serde_json::Value,
}

impl TryFrom<MetricCacheRow> for MetricRow {
    type Error = Error;

    fn try_from(row: MetricCacheRow) -> Result<MetricRow> {
        Ok(MetricRow {
            experiment_id: row.experiment_id,
            timestamp: row.ts,
            metric_name: row.metric_name,
            variant: row
                .variant
                .as_deref()
                .map(|v| from_db_enum(v, "metric variant"))
                .transpose()?,
            host_id: row.host_id,
            value: row.value,
            labels: from_json(row.labels, "metric labels")?,
        })
    }
}

// ── Store impl ───────────────────────────────────────────────────────

#[async_trait]
impl Store for PgStore {
    async fn create_experiment(&self, exp: &Experiment) -> Result<Experiment> {
        let sql = format!(
            "INSERT INTO experiments ({EXPERIMENT_COLS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             RETURNING {EXPERIMENT_COLS}"
        );
        let row = sqlx::query_as::<_, ExperimentRow>(&sql)
            .bind(exp.id)
            .bind(&exp.name)
            .bind(&exp.description)
            .bind(exp.phase.as_str())
            .bind(to_json(&exp.config, "experiment config")?)
            .bind(to_json(&exp.status, "experiment status")?)
            .bind(to_json(&exp.conditions, "experiment conditions")?)
            .bind(exp.promoted_variant.map(|v| v.as_str()))
            .bind(to_json(&exp.metadata, "experiment metadata")?)
            .bind(exp.version)
            .bind(exp.created_at)
            .bind(exp.updated_at)
            .bind(exp.started_at)
            .bind(exp.completed_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.try_into()
    }

    async fn get_experiment(&self, id: Uuid) -> Result<Experiment> {
        let sql = format!("SELECT {EXPERIMENT_COLS} FROM experiments WHERE id = $1");
        sqlx::query_as::<_, ExperimentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| Error::NotFound(format!("experiment {id}")))?
            .try_into()
    }

    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        let sql = format!("SELECT {EXPERIMENT_COLS} FROM experiments WHERE name = $1");
        sqlx::query_as::<_, ExperimentRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(Experiment::try_from)
            .transpose()
    }

    async fn list_experiments(&self, phase: Option<Phase>) -> Result<Vec<Experiment>> {
        let rows = match phase {
            Some(p) => {
                let sql = format!(
                    "SELECT {EXPERIMENT_COLS} FROM experiments
                     WHERE phase = $1 ORDER BY created_at DESC"
                );
                sqlx::query_as::<_, ExperimentRow>(&sql)
                    .bind(p.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {EXPERIMENT_COLS} FROM experiments ORDER BY created_at DESC"
                );
                sqlx::query_as::<_, ExperimentRow>(&sql)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx)?;
        rows.into_iter().map(Experiment::try_from).collect()
    }

    async fn update_experiment(&self, exp: &Experiment) -> Result<Experiment> {
        let sql = format!(
            "UPDATE experiments SET
                name = $2, description = $3, phase = $4, config = $5, status = $6,
                conditions = $7, promoted_variant = $8, metadata = $9,
                version = version + 1, updated_at = $10, started_at = $11, completed_at = $12
             WHERE id = $1 AND version = $13
             RETURNING {EXPERIMENT_COLS}"
        );
        let row = sqlx::query_as::<_, ExperimentRow>(&sql)
            .bind(exp.id)
            .bind(&exp.name)
            .bind(&exp.description)
            .bind(exp.phase.as_str())
            .bind(to_json(&exp.config, "experiment config")?)
            .bind(to_json(&exp.status, "experiment status")?)
            .bind(to_json(&exp.conditions, "experiment conditions")?)
            .bind(exp.promoted_variant.map(|v| v.as_str()))
            .bind(to_json(&exp.metadata, "experiment metadata")?)
            .bind(exp.updated_at)
            .bind(exp.started_at)
            .bind(exp.completed_at)
            .bind(exp.version)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        match row {
            Some(row) => row.try_into(),
            // Distinguish a stale version from a missing row.
            None => {
                let exists = sqlx::query_scalar::<_, i64>(
                    "SELECT version FROM experiments WHERE id = $1",
                )
                .bind(exp.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
                match exists {
                    Some(stored) => Err(Error::Conflict(format!(
                        "experiment {} version {} != stored {}",
                        exp.id, exp.version, stored
                    ))),
                    None => Err(Error::NotFound(format!("experiment {}", exp.id))),
                }
            }
        }
    }

    // ── Tasks ────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<Task> {
        let sql = format!(
            "INSERT INTO tasks ({TASK_COLS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
             RETURNING {TASK_COLS}"
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(task.id)
            .bind(&task.host_id)
            .bind(task.experiment_id)
            .bind(task.task_type.as_str())
            .bind(to_db_enum(&task.action))
            .bind(&task.config)
            .bind(task.priority)
            .bind(task.status.as_str())
            .bind(task.retry_count)
            .bind(task.assigned_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(&task.result)
            .bind(&task.error_message)
            .bind(task.created_at)
            .bind(task.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.try_into()
    }

    async fn get_task(&self, id: Uuid) -> Result<Task> {
        let sql = format!("SELECT {TASK_COLS} FROM tasks WHERE id = $1");
        sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLS} FROM tasks
             WHERE ($1::uuid IS NULL OR experiment_id = $1)
               AND ($2::text IS NULL OR host_id = $2)
               AND ($3::text IS NULL OR status = $3)
             ORDER BY priority DESC, created_at ASC"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(filter.experiment_id)
            .bind(&filter.host_id)
            .bind(filter.status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn claim_one_task(&self, host_id: &str) -> Result<Option<Task>> {
        // Single statement: SKIP LOCKED makes concurrent claims disjoint.
        let sql = format!(
            "UPDATE tasks SET status = 'assigned', assigned_at = now(), updated_at = now()
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE status = 'pending' AND (host_id = $1 OR host_id = '*')
                 ORDER BY priority DESC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {TASK_COLS}"
        );
        sqlx::query_as::<_, TaskRow>(&sql)
            .bind(host_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(Task::try_from)
            .transpose()
    }

    async fn update_task_status(&self, id: Uuid, update: &TaskStatusUpdate) -> Result<Task> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let sql = format!("SELECT {TASK_COLS} FROM tasks WHERE id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;

        let mut task: Task = row.try_into()?;
        let changed = crate::apply_task_update(&mut task, update)?;
        if changed {
            sqlx::query(
                "UPDATE tasks SET status = $2, started_at = $3, completed_at = $4,
                        result = $5, error_message = $6, updated_at = $7
                 WHERE id = $1",
            )
            .bind(task.id)
            .bind(task.status.as_str())
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(&task.result)
            .bind(&task.error_message)
            .bind(task.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(task)
    }

    async fn requeue_expired_claims(
        &self,
        lease: Duration,
        max_retries: i32,
    ) -> Result<ExpiredSweep> {
        let cutoff = Utc::now()
            - chrono::TimeDelta::from_std(lease)
                .map_err(|e| Error::Validation(format!("lease out of range: {e}")))?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let fail_sql = format!(
            "UPDATE tasks SET status = 'failed',
                    error_message = 'claim lease expired; retries exhausted',
                    completed_at = now(), updated_at = now()
             WHERE status IN ('assigned', 'running') AND assigned_at < $1
               AND retry_count >= $2
             RETURNING {TASK_COLS}"
        );
        let failed = sqlx::query_as::<_, TaskRow>(&fail_sql)
            .bind(cutoff)
            .bind(max_retries)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let requeue_sql = format!(
            "UPDATE tasks SET status = 'pending', retry_count = retry_count + 1,
                    error_message = 'claim lease expired', assigned_at = NULL,
                    updated_at = now()
             WHERE status IN ('assigned', 'running') AND assigned_at < $1
             RETURNING {TASK_COLS}"
        );
        let requeued = sqlx::query_as::<_, TaskRow>(&requeue_sql)
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;

        Ok(ExpiredSweep {
            requeued: requeued
                .into_iter()
                .map(Task::try_from)
                .collect::<Result<_>>()?,
            failed: failed
                .into_iter()
                .map(Task::try_from)
                .collect::<Result<_>>()?,
        })
    }

    async fn expire_pending_tasks(&self, experiment_id: Uuid) -> Result<Vec<Task>> {
        let sql = format!(
            "UPDATE tasks SET status = 'expired', completed_at = now(),
                    error_message = 'experiment cancelled', updated_at = now()
             WHERE experiment_id = $1 AND status = 'pending'
             RETURNING {TASK_COLS}"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(experiment_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter().map(Task::try_from).collect()
    }

    // ── Agents ───────────────────────────────────────────────────

    async fn upsert_agent(&self, record: &AgentRecord) -> Result<AgentRecord> {
        let sql = format!(
            "INSERT INTO agents ({AGENT_COLS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (host_id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                address = EXCLUDED.address,
                agent_version = EXCLUDED.agent_version,
                declared_status = EXCLUDED.declared_status,
                capabilities = EXCLUDED.capabilities,
                active_tasks = EXCLUDED.active_tasks,
                resources = EXCLUDED.resources,
                last_heartbeat = EXCLUDED.last_heartbeat
             RETURNING {AGENT_COLS}"
        );
        let row = sqlx::query_as::<_, AgentRow>(&sql)
            .bind(&record.host_id)
            .bind(&record.hostname)
            .bind(&record.address)
            .bind(&record.agent_version)
            .bind(&record.declared_status)
            .bind(to_json(&record.capabilities, "agent capabilities")?)
            .bind(to_json(&record.active_tasks, "agent active tasks")?)
            .bind(
                record
                    .resources
                    .as_ref()
                    .map(|r| to_json(r, "agent resources"))
                    .transpose()?,
            )
            .bind(record.first_seen)
            .bind(record.last_heartbeat)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.try_into()
    }

    async fn get_agent(&self, host_id: &str) -> Result<Option<AgentRecord>> {
        let sql = format!("SELECT {AGENT_COLS} FROM agents WHERE host_id = $1");
        sqlx::query_as::<_, AgentRow>(&sql)
            .bind(host_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(AgentRecord::try_from)
            .transpose()
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let sql = format!("SELECT {AGENT_COLS} FROM agents ORDER BY host_id");
        let rows = sqlx::query_as::<_, AgentRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter().map(AgentRecord::try_from).collect()
    }

    // ── Active pipelines ─────────────────────────────────────────

    async fn insert_active_pipeline(&self, pipeline: &ActivePipeline) -> Result<ActivePipeline> {
        let sql = format!(
            "INSERT INTO active_pipelines ({PIPELINE_COLS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING {PIPELINE_COLS}"
        );
        let row = sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(pipeline.id)
            .bind(&pipeline.host_id)
            .bind(pipeline.experiment_id)
            .bind(pipeline.variant.as_str())
            .bind(&pipeline.pipeline_url)
            .bind(&pipeline.config_hash)
            .bind(to_json(&pipeline.variables, "pipeline variables")?)
            .bind(pipeline.deployed_at)
            .bind(pipeline.stopped_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.try_into()
    }

    async fn get_active_pipeline(&self, id: Uuid) -> Result<ActivePipeline> {
        let sql = format!("SELECT {PIPELINE_COLS} FROM active_pipelines WHERE id = $1");
        sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| Error::NotFound(format!("pipeline deployment {id}")))?
            .try_into()
    }

    async fn stop_active_pipeline(&self, id: Uuid) -> Result<ActivePipeline> {
        let sql = format!(
            "UPDATE active_pipelines SET stopped_at = COALESCE(stopped_at, now())
             WHERE id = $1
             RETURNING {PIPELINE_COLS}"
        );
        sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| Error::NotFound(format!("pipeline deployment {id}")))?
            .try_into()
    }

    async fn list_active_pipelines(&self, host_id: Option<&str>) -> Result<Vec<ActivePipeline>> {
        let sql = format!(
            "SELECT {PIPELINE_COLS} FROM active_pipelines
             WHERE stopped_at IS NULL AND ($1::text IS NULL OR host_id = $1)
             ORDER BY deployed_at DESC"
        );
        let rows = sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(host_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter().map(ActivePipeline::try_from).collect()
    }

    async fn list_pipeline_history(&self, host_id: &str) -> Result<Vec<ActivePipeline>> {
        let sql = format!(
            "SELECT {PIPELINE_COLS} FROM active_pipelines
             WHERE host_id = $1 ORDER BY deployed_at DESC"
        );
        let rows = sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(host_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter().map(ActivePipeline::try_from).collect()
    }

    // ── Experiment events ────────────────────────────────────────

    async fn append_event(&self, event: NewEvent) -> Result<EventRecord> {
        let row = sqlx::query_as::<_, EventRow>(
            "INSERT INTO experiment_events (experiment_id, event_type, phase, message, metadata)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING seq, experiment_id, event_type, phase, message, metadata, created_at",
        )
        .bind(event.experiment_id)
        .bind(&event.event_type)
        .bind(event.phase.map(|p| p.as_str()))
        .bind(&event.message)
        .bind(&event.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.try_into()
    }

    async fn list_events(&self, experiment_id: Uuid, limit: i64) -> Result<Vec<EventRecord>> {
        // Append order; a bounded read keeps the most recent `limit` rows.
        let rows = if limit > 0 {
            sqlx::query_as::<_, EventRow>(
                "SELECT seq, experiment_id, event_type, phase, message, metadata, created_at
                 FROM (
                     SELECT seq, experiment_id, event_type, phase, message, metadata, created_at
                     FROM experiment_events WHERE experiment_id = $1
                     ORDER BY seq DESC LIMIT $2
                 ) recent
                 ORDER BY seq ASC",
            )
            .bind(experiment_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, EventRow>(
                "SELECT seq, experiment_id, event_type, phase, message, metadata, created_at
                 FROM experiment_events WHERE experiment_id = $1
                 ORDER BY seq ASC",
            )
            .bind(experiment_id)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(map_sqlx)?;
        rows.into_iter().map(EventRecord::try_from).collect()
    }

    // ── Metric cache ─────────────────────────────────────────────

    async fn insert_metrics(&self, rows: &[MetricRow]) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for row in rows {
            sqlx::query(
                "INSERT INTO metric_cache (experiment_id, ts, metric_name, variant, host_id, value, labels)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(row.experiment_id)
            .bind(row.timestamp)
            .bind(&row.metric_name)
            .bind(row.variant.map(|v| v.as_str()))
            .bind(&row.host_id)
            .bind(row.value)
            .bind(to_json(&row.labels, "metric labels")?)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(rows.len() as u64)
    }

    async fn list_metrics(&self, experiment_id: Uuid, limit: i64) -> Result<Vec<MetricRow>> {
        let sql = "SELECT experiment_id, ts, metric_name, variant, host_id, value, labels
             FROM metric_cache WHERE experiment_id = $1
             ORDER BY ts DESC LIMIT $2";
        let rows = sqlx::query_as::<_, MetricCacheRow>(sql)
            .bind(experiment_id)
            .bind(if limit > 0 { limit } else { i64::MAX })
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter().map(MetricRow::try_from).collect()
    }

    async fn prune_metrics(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM metric_cache WHERE ts < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    // ── KPI results ──────────────────────────────────────────────

    async fn insert_kpi_result(&self, result: &KpiResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO kpi_results (experiment_id, calculated_at, result)
             VALUES ($1, $2, $3)",
        )
        .bind(result.experiment_id)
        .bind(result.calculated_at)
        .bind(to_json(result, "kpi result")?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn latest_kpi_result(&self, experiment_id: Uuid) -> Result<Option<KpiResult>> {
        let row = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT result FROM kpi_results WHERE experiment_id = $1
             ORDER BY calculated_at DESC LIMIT 1",
        )
        .bind(experiment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(|v| from_json(v, "kpi result")).transpose()
    }

    async fn list_kpi_results(&self, experiment_id: Uuid, limit: i64) -> Result<Vec<KpiResult>> {
        let rows = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT result FROM kpi_results WHERE experiment_id = $1
             ORDER BY calculated_at DESC LIMIT $2",
        )
        .bind(experiment_id)
        .bind(if limit > 0 { limit } else { i64::MAX })
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.into_iter().map(|v| from_json(v, "kpi result")).collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
